use murmur_core::{MessageEnvelope, Result, StreamKey};
use murmur_storage::StreamStore;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// One conversation thread: a bounded ring of recent envelopes behind a
/// per-stream lock, a prompt context cache, and the last-activity stamp.
pub struct ChatStream {
    pub key: StreamKey,
    window: Mutex<VecDeque<MessageEnvelope>>,
    capacity: usize,
    context_cache: Mutex<Option<String>>,
    last_active_ms: AtomicI64,
}

impl ChatStream {
    fn new(key: StreamKey, capacity: usize) -> Self {
        Self {
            key,
            window: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            context_cache: Mutex::new(None),
            last_active_ms: AtomicI64::new(0),
        }
    }

    /// Append to the recent window. Timestamps within a stream never move
    /// backwards; a stale stamp is clamped to the newest seen.
    pub fn push(&self, mut envelope: MessageEnvelope) {
        let last = self.last_active_ms.load(Ordering::SeqCst);
        if envelope.timestamp_ms < last {
            warn!(stream = %self.key, "Envelope timestamp went backwards, clamping");
            envelope.timestamp_ms = last;
        }
        self.last_active_ms.store(envelope.timestamp_ms, Ordering::SeqCst);

        let mut window = self.window.lock().expect("stream window lock");
        if window.len() == self.capacity {
            window.pop_front();
        }
        window.push_back(envelope);
        *self.context_cache.lock().expect("context cache lock") = None;
    }

    pub fn recent(&self, n: usize) -> Vec<MessageEnvelope> {
        let window = self.window.lock().expect("stream window lock");
        let skip = window.len().saturating_sub(n);
        window.iter().skip(skip).cloned().collect()
    }

    /// Rendered context for prompts, rebuilt only after new messages.
    pub fn context_text(&self, n: usize) -> String {
        if let Some(cached) = self.context_cache.lock().expect("context cache lock").clone() {
            return cached;
        }
        let rendered = self
            .recent(n)
            .iter()
            .map(|e| {
                format!(
                    "{}: {}",
                    e.message_info.user.readable_name(),
                    e.plain_text()
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        *self.context_cache.lock().expect("context cache lock") = Some(rendered.clone());
        rendered
    }

    pub fn last_active_ms(&self) -> i64 {
        self.last_active_ms.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.window.lock().expect("stream window lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owns every live stream. Streams come into being lazily on first
/// envelope (or an explicit cold start) and die only on platform reset.
pub struct ChatStreamManager {
    streams: RwLock<HashMap<StreamKey, Arc<ChatStream>>>,
    window_capacity: usize,
    store: Option<StreamStore>,
}

impl ChatStreamManager {
    pub fn new(window_capacity: usize, store: Option<StreamStore>) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            window_capacity,
            store,
        }
    }

    pub fn get(&self, key: &StreamKey) -> Option<Arc<ChatStream>> {
        self.streams.read().expect("stream map lock").get(key).cloned()
    }

    pub fn get_or_create(&self, key: &StreamKey) -> Arc<ChatStream> {
        if let Some(stream) = self.get(key) {
            return stream;
        }
        let mut streams = self.streams.write().expect("stream map lock");
        streams
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(stream = %key, "Chat stream created");
                Arc::new(ChatStream::new(key.clone(), self.window_capacity))
            })
            .clone()
    }

    /// Explicit creation for proactive flows on streams that have no
    /// traffic yet.
    pub fn cold_start(&self, key: &StreamKey) -> Arc<ChatStream> {
        info!(stream = %key, "Cold-starting chat stream");
        self.get_or_create(key)
    }

    /// Record an envelope into its stream and the durable stream table.
    pub fn record(&self, envelope: &MessageEnvelope) -> Result<Arc<ChatStream>> {
        let key = envelope.stream_key();
        let stream = self.get_or_create(&key);
        stream.push(envelope.clone());
        if let Some(store) = &self.store {
            store.touch(&key.to_string(), &envelope.platform, envelope.timestamp_ms)?;
        }
        Ok(stream)
    }

    /// Platform reset destroys that platform's streams.
    pub fn reset_platform(&self, platform: &str) -> usize {
        let mut streams = self.streams.write().expect("stream map lock");
        let before = streams.len();
        streams.retain(|key, _| key.platform != platform);
        let removed = before - streams.len();
        if removed > 0 {
            info!(platform, removed, "Platform reset cleared streams");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.streams.read().expect("stream map lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_core::{MessageInfo, MessageKind, Segment, UserInfo};

    fn envelope(user: &str, text: &str, ts: i64) -> MessageEnvelope {
        let mut env = MessageEnvelope::incoming(
            "qq",
            "m",
            MessageInfo {
                message_type: MessageKind::Private,
                user: UserInfo::new(user),
                group: None,
                self_id: "bot".to_string(),
                to_me: true,
            },
            Segment::text(text),
        );
        env.timestamp_ms = ts;
        env
    }

    #[test]
    fn test_window_is_bounded_ring() {
        let manager = ChatStreamManager::new(3, None);
        for i in 0..5 {
            manager.record(&envelope("1", &format!("m{}", i), 1000 + i)).unwrap();
        }
        let stream = manager.get(&StreamKey::private("qq", "1")).unwrap();
        assert_eq!(stream.len(), 3);
        let texts: Vec<String> = stream.recent(10).iter().map(|e| e.plain_text()).collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_timestamps_never_go_backwards() {
        let manager = ChatStreamManager::new(10, None);
        manager.record(&envelope("1", "first", 2000)).unwrap();
        manager.record(&envelope("1", "second", 1000)).unwrap();
        let stream = manager.get(&StreamKey::private("qq", "1")).unwrap();
        let recent = stream.recent(10);
        assert!(recent[1].timestamp_ms >= recent[0].timestamp_ms);
        assert_eq!(stream.last_active_ms(), 2000);
    }

    #[test]
    fn test_lazy_creation_and_platform_reset() {
        let manager = ChatStreamManager::new(10, None);
        assert!(manager.is_empty());
        manager.record(&envelope("1", "hi", 1000)).unwrap();
        manager.cold_start(&StreamKey::private("tg", "2"));
        assert_eq!(manager.len(), 2);

        assert_eq!(manager.reset_platform("qq"), 1);
        assert!(manager.get(&StreamKey::private("qq", "1")).is_none());
        assert!(manager.get(&StreamKey::private("tg", "2")).is_some());
    }

    #[test]
    fn test_context_cache_invalidated_by_push() {
        let manager = ChatStreamManager::new(10, None);
        manager.record(&envelope("1", "hello", 1000)).unwrap();
        let stream = manager.get(&StreamKey::private("qq", "1")).unwrap();
        let first = stream.context_text(10);
        assert!(first.contains("hello"));

        manager.record(&envelope("1", "again", 2000)).unwrap();
        let second = stream.context_text(10);
        assert!(second.contains("again"));
    }
}
