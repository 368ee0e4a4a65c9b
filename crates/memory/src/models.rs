use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Vector-store collection names, one per staging layer plus the graph's
/// node index.
pub const PERCEPTUAL_COLLECTION: &str = "perceptual_blocks";
pub const SHORT_TERM_COLLECTION: &str = "short_term_memories";
pub const NODE_COLLECTION: &str = "graph_nodes";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMessage {
    pub stream_key: String,
    pub sender: String,
    pub content: String,
    pub timestamp_ms: i64,
}

/// One closed perceptual block: K sequential messages from a single stream,
/// embedded as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryBlock {
    pub id: String,
    pub stream_key: String,
    pub messages: Vec<BlockMessage>,
    pub combined_text: String,
    pub has_embedding: bool,
    pub activation_count: u32,
    pub created_at_ms: i64,
    /// Scheduled for promotion; the block stays in the heap until FIFO
    /// eviction regardless.
    #[serde(default)]
    pub promoted: bool,
}

impl MemoryBlock {
    pub fn new(stream_key: &str, messages: Vec<BlockMessage>) -> Self {
        let combined_text = combine_messages(&messages);
        Self {
            id: format!("block_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]),
            stream_key: stream_key.to_string(),
            messages,
            combined_text,
            has_embedding: false,
            activation_count: 0,
            created_at_ms: Utc::now().timestamp_millis(),
            promoted: false,
        }
    }
}

fn combine_messages(messages: &[BlockMessage]) -> String {
    messages
        .iter()
        .map(|m| {
            let time = chrono::DateTime::from_timestamp_millis(m.timestamp_ms)
                .map(|t| t.format("%H:%M").to_string())
                .unwrap_or_default();
            format!("[{}] {}: {}", time, m.sender, m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// A structured short-term memory: one `(subject, topic, object)` triple
/// plus free-form attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortTermMemory {
    pub id: String,
    pub subject: String,
    pub topic: String,
    pub object: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    pub importance: f32,
    pub activation_count: u32,
    pub last_accessed_ms: i64,
    pub created_at_ms: i64,
    #[serde(default)]
    pub origin_block_ids: Vec<String>,
    #[serde(default)]
    pub has_embedding: bool,
    /// Currently queued for long-term promotion; exempt from eviction.
    #[serde(default)]
    pub in_promotion: bool,
}

impl ShortTermMemory {
    pub fn new(subject: &str, topic: &str, object: &str) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: format!("stm_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]),
            subject: subject.to_string(),
            topic: topic.to_string(),
            object: object.to_string(),
            attributes: Map::new(),
            importance: 0.5,
            activation_count: 0,
            last_accessed_ms: now,
            created_at_ms: now,
            origin_block_ids: Vec::new(),
            has_embedding: false,
            in_promotion: false,
        }
    }

    /// Text rendering used for embeddings and prompts.
    pub fn content_text(&self) -> String {
        let mut text = format!("{} {} {}", self.subject, self.topic, self.object);
        if !self.attributes.is_empty() {
            let attrs: Vec<String> = self
                .attributes
                .iter()
                .map(|(k, v)| format!("{}={}", k, v.as_str().map(String::from).unwrap_or_else(|| v.to_string())))
                .collect();
            text.push_str(&format!(" ({})", attrs.join(", ")));
        }
        text
    }

    /// Combined eviction rank: importance degraded by age.
    pub fn eviction_rank(&self, decay: f32, now_ms: i64) -> f32 {
        let age_hours = ((now_ms - self.last_accessed_ms).max(0) as f32) / 3_600_000.0;
        self.importance * decay.powf(age_hours)
    }
}

/// Verdict of the retrieval sufficiency judge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeDecision {
    pub sufficient: bool,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub additional_queries: Vec<String>,
}

impl JudgeDecision {
    /// A failed judge defaults to insufficient so retrieval expands.
    pub fn insufficient(reason: &str) -> Self {
        Self {
            sufficient: false,
            reasoning: reason.to_string(),
            additional_queries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    Perceptual,
    ShortTerm,
    LongTerm,
}

/// One scored retrieval result, regardless of the tier it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedMemory {
    pub id: String,
    pub tier: MemoryTier,
    pub content: String,
    pub score: f32,
    /// 1 for direct hits, +1 per BFS hop.
    pub graph_distance: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStats {
    pub perceptual_blocks: usize,
    pub perceptual_pending: usize,
    pub perceptual_activated: usize,
    pub short_term_memories: usize,
    pub promotion_queue: usize,
    pub graph_nodes: usize,
    pub graph_edges: usize,
    pub long_term_memories: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_combined_text() {
        let block = MemoryBlock::new(
            "qq:private:1",
            vec![
                BlockMessage {
                    stream_key: "qq:private:1".to_string(),
                    sender: "alice".to_string(),
                    content: "hello".to_string(),
                    timestamp_ms: 0,
                },
                BlockMessage {
                    stream_key: "qq:private:1".to_string(),
                    sender: "bot".to_string(),
                    content: "hi".to_string(),
                    timestamp_ms: 60_000,
                },
            ],
        );
        assert!(block.combined_text.contains("alice: hello"));
        assert!(block.combined_text.contains("bot: hi"));
        assert_eq!(block.combined_text.lines().count(), 2);
    }

    #[test]
    fn test_eviction_rank_decays_with_age() {
        let mut mem = ShortTermMemory::new("we", "meet", "next wednesday");
        mem.importance = 0.8;
        let now = mem.last_accessed_ms;
        let fresh = mem.eviction_rank(0.98, now);
        let stale = mem.eviction_rank(0.98, now + 48 * 3_600_000);
        assert!((fresh - 0.8).abs() < 1e-6);
        assert!(stale < fresh);
    }

    #[test]
    fn test_content_text_includes_attributes() {
        let mut mem = ShortTermMemory::new("we", "meet", "plan");
        mem.attributes
            .insert("time".to_string(), serde_json::json!("next Wednesday"));
        let text = mem.content_text();
        assert!(text.starts_with("we meet plan"));
        assert!(text.contains("time=next Wednesday"));
    }
}
