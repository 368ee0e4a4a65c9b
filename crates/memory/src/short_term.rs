use chrono::Utc;
use murmur_core::{MemoryConfig, Result};
use murmur_providers::{EmbeddingProvider, LanguageModel, LlmRequest, VectorStore};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::models::{MemoryBlock, ShortTermMemory, SHORT_TERM_COLLECTION};
use crate::ops::{parse_decision, parse_triples, MemoryDecision};

const EXTRACTION_PROMPT: &str = "Extract stable facts from this chat fragment as memories.\n\
Return a JSON array; each element is\n\
{\"subject\": ..., \"topic\": ..., \"object\": ..., \"attributes\": {...}, \"importance\": 0.0-1.0}.\n\
Return [] when nothing is worth remembering.\n\nFragment:\n";

const DECISION_PROMPT: &str = "A new candidate memory arrived. Decide how it relates to the \
existing similar memories listed below.\n\
Reply with JSON: {\"decision\": \"merge\"|\"update\"|\"create_new\"|\"discard\", \"target_id\": \"...\"}.\n\
merge = the candidate restates an existing memory (give target_id);\n\
update = the candidate contradicts an existing memory's details (give target_id);\n\
create_new = genuinely new; discard = noise.\n\n";

/// Structured short-term store: capacity-bounded triples with importance
/// decay and an LLM-decided merge pipeline.
///
/// Not internally synchronized: the engine owns it behind a lock.
pub struct ShortTermLayer {
    capacity: usize,
    decay_factor: f32,
    transfer_threshold: f32,
    neighbor_k: usize,
    memories: HashMap<String, ShortTermMemory>,
    embedder: Arc<dyn EmbeddingProvider>,
    vectors: Arc<dyn VectorStore>,
    llm: Arc<dyn LanguageModel>,
    model_name: String,
}

impl ShortTermLayer {
    pub fn new(
        cfg: &MemoryConfig,
        model_name: &str,
        embedder: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorStore>,
        llm: Arc<dyn LanguageModel>,
    ) -> Self {
        Self {
            capacity: cfg.short_term_max_memories,
            decay_factor: cfg.short_term_decay_factor,
            transfer_threshold: cfg.short_term_transfer_threshold,
            neighbor_k: 5,
            memories: HashMap::new(),
            embedder,
            vectors,
            llm,
            model_name: model_name.to_string(),
        }
    }

    /// Extract triples from a promoted block and fold each candidate into
    /// the store. A model failure is a NO_OP: nothing changes, the block's
    /// promotion state stays intact.
    pub async fn ingest_block(&mut self, block: &MemoryBlock) -> Result<Vec<String>> {
        let request = LlmRequest::new(
            &self.model_name,
            &format!("{}{}", EXTRACTION_PROMPT, block.combined_text),
        )
        .with_temperature(0.2);
        let raw = match self.llm.complete(&request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(block = %block.id, error = %e, "Triple extraction failed, NO_OP");
                return Ok(Vec::new());
            }
        };

        let mut touched = Vec::new();
        for triple in parse_triples(&raw) {
            let mut candidate = ShortTermMemory::new(&triple.subject, &triple.topic, &triple.object);
            candidate.attributes = triple.attributes;
            candidate.importance = triple.importance.unwrap_or(0.5).clamp(0.0, 1.0);
            candidate.origin_block_ids = vec![block.id.clone()];

            if let Some(id) = self.decide_and_apply(candidate).await? {
                touched.push(id);
            }
        }
        self.evict_if_needed().await?;
        Ok(touched)
    }

    /// Retrieve the top-N neighbours and let the model pick one of
    /// MERGE / UPDATE / CREATE_NEW / DISCARD.
    async fn decide_and_apply(&mut self, candidate: ShortTermMemory) -> Result<Option<String>> {
        let neighbours = self.similar(&candidate.content_text(), self.neighbor_k).await?;
        if neighbours.is_empty() {
            return Ok(Some(self.insert(candidate).await?));
        }

        let mut prompt = String::from(DECISION_PROMPT);
        prompt.push_str(&format!("Candidate: {}\n\nExisting:\n", candidate.content_text()));
        for (memory, score) in &neighbours {
            prompt.push_str(&format!(
                "- id={} similarity={:.2} :: {}\n",
                memory.id,
                score,
                memory.content_text()
            ));
        }

        let request = LlmRequest::new(&self.model_name, &prompt).with_temperature(0.2);
        let decision = match self.llm.complete(&request).await {
            Ok(raw) => parse_decision(&raw),
            Err(e) => {
                warn!(error = %e, "Memory decision call failed, NO_OP");
                return Ok(None);
            }
        };

        match decision {
            Some(MemoryDecision::Merge { target_id }) => self.merge_into(&target_id, candidate).await,
            Some(MemoryDecision::Update { target_id }) => self.update_onto(&target_id, candidate).await,
            Some(MemoryDecision::CreateNew) => Ok(Some(self.insert(candidate).await?)),
            Some(MemoryDecision::Discard) => {
                debug!(candidate = %candidate_desc(&candidate), "Candidate discarded");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Fold the candidate's attributes into an existing memory: existing
    /// keys win, importance bumps by a bounded delta.
    async fn merge_into(
        &mut self,
        target_id: &str,
        candidate: ShortTermMemory,
    ) -> Result<Option<String>> {
        let Some(target) = self.memories.get_mut(target_id) else {
            warn!(target_id, "Merge target vanished, inserting candidate instead");
            return Ok(Some(self.insert(candidate).await?));
        };
        for (key, value) in candidate.attributes {
            target.attributes.entry(key).or_insert(value);
        }
        target.importance = (target.importance + 0.1).min(1.0);
        target.last_accessed_ms = Utc::now().timestamp_millis();
        target.activation_count += 1;
        target.origin_block_ids.extend(candidate.origin_block_ids);
        let id = target.id.clone();
        self.reembed(&id).await?;
        Ok(Some(id))
    }

    /// Replace contradicting details on an existing memory.
    async fn update_onto(
        &mut self,
        target_id: &str,
        candidate: ShortTermMemory,
    ) -> Result<Option<String>> {
        let Some(target) = self.memories.get_mut(target_id) else {
            warn!(target_id, "Update target vanished, inserting candidate instead");
            return Ok(Some(self.insert(candidate).await?));
        };
        target.object = candidate.object;
        for (key, value) in candidate.attributes {
            target.attributes.insert(key, value);
        }
        target.importance = (target.importance + 0.1).min(1.0);
        target.last_accessed_ms = Utc::now().timestamp_millis();
        target.origin_block_ids.extend(candidate.origin_block_ids);
        let id = target.id.clone();
        self.reembed(&id).await?;
        Ok(Some(id))
    }

    async fn insert(&mut self, mut memory: ShortTermMemory) -> Result<String> {
        match self.embedder.embed(&memory.content_text()).await {
            Ok(embedding) => {
                self.vectors
                    .upsert(SHORT_TERM_COLLECTION, &memory.id, &embedding)
                    .await?;
                memory.has_embedding = true;
            }
            Err(e) => {
                warn!(memory = %memory.id, error = %e, "Short-term embedding failed, leaving for reindex");
            }
        }
        let id = memory.id.clone();
        info!(memory = %id, content = %memory.content_text(), "Short-term memory created");
        self.memories.insert(id.clone(), memory);
        Ok(id)
    }

    async fn reembed(&mut self, id: &str) -> Result<()> {
        let Some(memory) = self.memories.get_mut(id) else {
            return Ok(());
        };
        match self.embedder.embed(&memory.content_text()).await {
            Ok(embedding) => {
                self.vectors.upsert(SHORT_TERM_COLLECTION, id, &embedding).await?;
                memory.has_embedding = true;
            }
            Err(e) => {
                memory.has_embedding = false;
                warn!(memory = %id, error = %e, "Re-embedding failed, leaving for reindex");
            }
        }
        Ok(())
    }

    /// Neighbours ranked by similarity; equal scores break toward the most
    /// recently accessed memory.
    async fn similar(&self, text: &str, top_k: usize) -> Result<Vec<(ShortTermMemory, f32)>> {
        let embedding = match self.embedder.embed(text).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(error = %e, "Similarity embedding failed");
                return Ok(Vec::new());
            }
        };
        let hits = self
            .vectors
            .search(SHORT_TERM_COLLECTION, &embedding, top_k, 0.0)
            .await?;
        let mut out: Vec<(ShortTermMemory, f32)> = hits
            .into_iter()
            .filter_map(|hit| self.memories.get(&hit.id).map(|m| (m.clone(), hit.score)))
            .collect();
        out.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.0.last_accessed_ms.cmp(&a.0.last_accessed_ms))
        });
        Ok(out)
    }

    /// Search used by retrieval; hits are touched as accesses.
    pub async fn search(&mut self, query: &str, top_k: usize) -> Result<Vec<(ShortTermMemory, f32)>> {
        let ranked = self.similar(query, top_k).await?;
        let scored: Vec<(String, f32)> = ranked.iter().map(|(m, s)| (m.id.clone(), *s)).collect();
        let mut out = Vec::with_capacity(scored.len());
        for (id, score) in scored {
            self.record_access(&id);
            if let Some(memory) = self.memories.get(&id) {
                out.push((memory.clone(), score));
            }
        }
        Ok(out)
    }

    /// Access bookkeeping: refresh recency, bump activation, apply the
    /// per-access decay step.
    pub fn record_access(&mut self, id: &str) {
        if let Some(memory) = self.memories.get_mut(id) {
            memory.activation_count += 1;
            memory.last_accessed_ms = Utc::now().timestamp_millis();
            memory.importance *= self.decay_factor;
        }
    }

    /// Background decay of everything not accessed since the cutoff.
    pub fn apply_decay(&mut self, unaccessed_since_ms: i64) -> usize {
        let mut decayed = 0;
        for memory in self.memories.values_mut() {
            if memory.last_accessed_ms < unaccessed_since_ms {
                memory.importance *= self.decay_factor;
                decayed += 1;
            }
        }
        decayed
    }

    /// Memories over the transfer threshold, marked as in-promotion so
    /// eviction leaves them alone until the consolidator settles them.
    pub fn take_transfer_candidates(&mut self) -> Vec<ShortTermMemory> {
        let threshold = self.transfer_threshold;
        let mut candidates = Vec::new();
        for memory in self.memories.values_mut() {
            if memory.importance >= threshold && !memory.in_promotion {
                memory.in_promotion = true;
                candidates.push(memory.clone());
            }
        }
        candidates
    }

    /// Give up on promoting these (retries exhausted); they become ordinary
    /// evictable memories again.
    pub fn release_promotion(&mut self, ids: &[String]) {
        for id in ids {
            if let Some(memory) = self.memories.get_mut(id) {
                memory.in_promotion = false;
            }
        }
    }

    /// Promotion finished: the memories now live in the graph.
    pub async fn complete_transfer(&mut self, ids: &[String]) -> Result<()> {
        for id in ids {
            if self.memories.remove(id).is_some() {
                self.vectors.remove(SHORT_TERM_COLLECTION, id).await?;
            }
        }
        Ok(())
    }

    /// Evict by lowest `(importance × decay^age)` until back under
    /// capacity. Memories being promoted are never deleted.
    async fn evict_if_needed(&mut self) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        while self.memories.len() > self.capacity {
            let victim = self
                .memories
                .values()
                .filter(|m| !m.in_promotion)
                .min_by(|a, b| {
                    a.eviction_rank(self.decay_factor, now)
                        .partial_cmp(&b.eviction_rank(self.decay_factor, now))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|m| m.id.clone());
            match victim {
                Some(id) => {
                    debug!(memory = %id, "Short-term eviction");
                    self.memories.remove(&id);
                    self.vectors.remove(SHORT_TERM_COLLECTION, &id).await?;
                }
                None => break,
            }
        }
        Ok(())
    }

    pub async fn reindex(&mut self) -> Result<usize> {
        let ids: Vec<String> = self
            .memories
            .values()
            .filter(|m| !m.has_embedding)
            .map(|m| m.id.clone())
            .collect();
        let mut fixed = 0;
        for id in ids {
            self.reembed(&id).await?;
            if self.memories.get(&id).map(|m| m.has_embedding).unwrap_or(false) {
                fixed += 1;
            }
        }
        Ok(fixed)
    }

    pub fn snapshot(&self) -> Vec<ShortTermMemory> {
        self.memories.values().cloned().collect()
    }

    pub fn restore(&mut self, memories: Vec<ShortTermMemory>) {
        self.memories = memories
            .into_iter()
            .map(|mut m| {
                m.has_embedding = false;
                (m.id.clone(), m)
            })
            .collect();
    }

    pub fn len(&self) -> usize {
        self.memories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ShortTermMemory> {
        self.memories.get(id)
    }
}

fn candidate_desc(candidate: &ShortTermMemory) -> String {
    candidate.content_text()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BlockMessage;
    use murmur_providers::testing::{HashEmbedder, InMemoryVectorStore, ScriptedModel};

    fn block(text: &str) -> MemoryBlock {
        MemoryBlock::new(
            "qq:private:1",
            vec![BlockMessage {
                stream_key: "qq:private:1".to_string(),
                sender: "alice".to_string(),
                content: text.to_string(),
                timestamp_ms: 1000,
            }],
        )
    }

    fn layer(model: Arc<ScriptedModel>) -> ShortTermLayer {
        ShortTermLayer::new(
            &MemoryConfig::default(),
            "judge-mini",
            Arc::new(HashEmbedder::default()),
            Arc::new(InMemoryVectorStore::new()),
            model,
        )
    }

    const MEETING_TRIPLE: &str = r#"[{"subject": "we", "topic": "meet",
        "object": "next wednesday", "attributes": {"time": "next Wednesday"},
        "importance": 0.65}]"#;

    #[tokio::test]
    async fn test_extraction_creates_memory_with_importance() {
        let model = Arc::new(ScriptedModel::new("[]"));
        model.push_response(MEETING_TRIPLE);
        let mut layer = layer(model);

        let ids = layer.ingest_block(&block("we will meet next wednesday")).await.unwrap();
        assert_eq!(ids.len(), 1);
        let memory = layer.get(&ids[0]).unwrap();
        assert_eq!(memory.subject, "we");
        assert_eq!(memory.topic, "meet");
        assert_eq!(
            memory.attributes.get("time").and_then(|v| v.as_str()),
            Some("next Wednesday")
        );
        assert!(memory.importance >= 0.6);
    }

    #[tokio::test]
    async fn test_merge_bumps_importance_and_folds_attributes() {
        let model = Arc::new(ScriptedModel::new("[]"));
        model.push_response(MEETING_TRIPLE);
        let mut layer = layer(model.clone());
        let ids = layer.ingest_block(&block("we will meet next wednesday")).await.unwrap();
        let first_id = ids[0].clone();
        let before = layer.get(&first_id).unwrap().importance;

        // Second extraction: same fact plus a place attribute; the model
        // chooses merge.
        model.push_response(
            r#"[{"subject": "we", "topic": "meet", "object": "next wednesday",
                 "attributes": {"place": "cafe"}, "importance": 0.5}]"#,
        );
        model.push_response(&format!(r#"{{"decision": "merge", "target_id": "{}"}}"#, first_id));
        let ids = layer.ingest_block(&block("meet next wednesday at the cafe")).await.unwrap();

        assert_eq!(ids, vec![first_id.clone()]);
        assert_eq!(layer.len(), 1);
        let merged = layer.get(&first_id).unwrap();
        assert!(merged.importance > before);
        assert_eq!(merged.attributes.get("place").and_then(|v| v.as_str()), Some("cafe"));
        assert_eq!(
            merged.attributes.get("time").and_then(|v| v.as_str()),
            Some("next Wednesday")
        );
        assert_eq!(merged.origin_block_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_update_replaces_contradicting_details() {
        let model = Arc::new(ScriptedModel::new("[]"));
        model.push_response(MEETING_TRIPLE);
        let mut layer = layer(model.clone());
        let first_id = layer
            .ingest_block(&block("we will meet next wednesday"))
            .await
            .unwrap()
            .remove(0);

        model.push_response(
            r#"[{"subject": "we", "topic": "meet", "object": "next friday",
                 "attributes": {"time": "next Friday"}, "importance": 0.5}]"#,
        );
        model.push_response(&format!(r#"{{"decision": "update", "target_id": "{}"}}"#, first_id));
        layer.ingest_block(&block("actually we meet friday")).await.unwrap();

        let updated = layer.get(&first_id).unwrap();
        assert_eq!(updated.object, "next friday");
        assert_eq!(
            updated.attributes.get("time").and_then(|v| v.as_str()),
            Some("next Friday")
        );
    }

    #[tokio::test]
    async fn test_discard_and_model_failure_are_no_ops() {
        let model = Arc::new(ScriptedModel::new("[]"));
        model.push_response(MEETING_TRIPLE);
        let mut layer = layer(model.clone());
        layer.ingest_block(&block("seed")).await.unwrap();
        assert_eq!(layer.len(), 1);

        model.push_response(r#"[{"subject": "x", "topic": "y", "object": "z"}]"#);
        model.push_response(r#"{"decision": "discard"}"#);
        let ids = layer.ingest_block(&block("noise")).await.unwrap();
        assert!(ids.is_empty());
        assert_eq!(layer.len(), 1);

        // Unparseable decision: NO_OP as well.
        model.push_response(r#"[{"subject": "a", "topic": "b", "object": "c"}]"#);
        model.push_response("definitely not json");
        let ids = layer.ingest_block(&block("mystery")).await.unwrap();
        assert!(ids.is_empty());
        assert_eq!(layer.len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_eviction_spares_promoting_memories() {
        let model = Arc::new(ScriptedModel::new(r#"{"decision": "create_new"}"#));
        let mut cfg = MemoryConfig::default();
        cfg.short_term_max_memories = 2;
        let mut layer = ShortTermLayer::new(
            &cfg,
            "judge-mini",
            Arc::new(HashEmbedder::default()),
            Arc::new(InMemoryVectorStore::new()),
            model.clone(),
        );

        for (i, text) in ["alpha fact", "beta fact", "gamma fact"].iter().enumerate() {
            model.push_response(&format!(
                r#"[{{"subject": "s{i}", "topic": "t{i}", "object": "{text}", "importance": {imp}}}]"#,
                i = i,
                text = text,
                imp = 0.3 + 0.2 * i as f32,
            ));
            layer.ingest_block(&block(text)).await.unwrap();
        }
        assert_eq!(layer.len(), 2);

        // The highest-importance memory survives and can be marked for
        // promotion, shielding it from later eviction.
        let candidates = layer.take_transfer_candidates();
        assert!(candidates.iter().any(|m| m.importance >= 0.6));
    }

    #[tokio::test]
    async fn test_transfer_lifecycle() {
        let model = Arc::new(ScriptedModel::new("[]"));
        model.push_response(MEETING_TRIPLE);
        let mut layer = layer(model);
        let id = layer.ingest_block(&block("we will meet next wednesday")).await.unwrap().remove(0);

        let candidates = layer.take_transfer_candidates();
        assert_eq!(candidates.len(), 1);
        // Marked memories are not re-offered.
        assert!(layer.take_transfer_candidates().is_empty());

        layer.complete_transfer(&[id.clone()]).await.unwrap();
        assert!(layer.get(&id).is_none());
        assert!(layer.is_empty());
    }

    #[tokio::test]
    async fn test_background_decay_hits_only_stale_memories() {
        let model = Arc::new(ScriptedModel::new("[]"));
        model.push_response(MEETING_TRIPLE);
        let mut layer = layer(model);
        let id = layer.ingest_block(&block("we will meet next wednesday")).await.unwrap().remove(0);
        let before = layer.get(&id).unwrap().importance;

        // Cutoff in the past: nothing decays.
        assert_eq!(layer.apply_decay(0), 0);
        // Cutoff in the future: everything unaccessed decays.
        let future = Utc::now().timestamp_millis() + 10_000;
        assert_eq!(layer.apply_decay(future), 1);
        assert!(layer.get(&id).unwrap().importance < before);
    }
}
