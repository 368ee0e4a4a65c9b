use async_trait::async_trait;
use murmur_events::EventParams;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Time,
    Event,
    Custom,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Time => "time",
            TriggerKind::Event => "event",
            TriggerKind::Custom => "custom",
        }
    }
}

/// Predicate evaluated once per tick for CUSTOM entries.
pub type TaskPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

#[async_trait]
pub trait TaskCallback: Send + Sync {
    async fn run(&self, params: EventParams);
}

struct FnCallback<F>(F);

#[async_trait]
impl<F, Fut> TaskCallback for FnCallback<F>
where
    F: Fn(EventParams) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn run(&self, params: EventParams) {
        (self.0)(params).await;
    }
}

/// Wrap an async closure as a schedulable callback.
pub fn callback_fn<F, Fut>(f: F) -> Arc<dyn TaskCallback>
where
    F: Fn(EventParams) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnCallback(f))
}

#[derive(Clone)]
pub enum TriggerConfig {
    /// Fire after `delay_seconds`, or at `trigger_at_ms`, optionally
    /// repeating every `interval_seconds` when the entry is recurring.
    Time {
        delay_seconds: Option<u64>,
        trigger_at_ms: Option<i64>,
        interval_seconds: Option<u64>,
    },
    /// Fire when the event manager dispatches `event_name`.
    Event { event_name: String },
    /// Fire on any tick where the predicate returns true.
    Custom { condition: TaskPredicate },
}

impl TriggerConfig {
    pub fn kind(&self) -> TriggerKind {
        match self {
            TriggerConfig::Time { .. } => TriggerKind::Time,
            TriggerConfig::Event { .. } => TriggerKind::Event,
            TriggerConfig::Custom { .. } => TriggerKind::Custom,
        }
    }

    pub fn delay(seconds: u64) -> Self {
        TriggerConfig::Time {
            delay_seconds: Some(seconds),
            trigger_at_ms: None,
            interval_seconds: None,
        }
    }

    pub fn at(timestamp_ms: i64) -> Self {
        TriggerConfig::Time {
            delay_seconds: None,
            trigger_at_ms: Some(timestamp_ms),
            interval_seconds: None,
        }
    }

    pub fn every(seconds: u64) -> Self {
        TriggerConfig::Time {
            delay_seconds: None,
            trigger_at_ms: None,
            interval_seconds: Some(seconds),
        }
    }

    pub fn event(event_name: &str) -> Self {
        TriggerConfig::Event {
            event_name: event_name.to_string(),
        }
    }

    pub fn custom(condition: TaskPredicate) -> Self {
        TriggerConfig::Custom { condition }
    }
}

pub(crate) struct ScheduleEntry {
    pub id: String,
    pub name: String,
    pub trigger: TriggerConfig,
    pub recurring: bool,
    pub active: bool,
    pub callback: Arc<dyn TaskCallback>,
    pub bound_params: EventParams,
    pub created_at_ms: i64,
    pub last_triggered_at_ms: Option<i64>,
    pub trigger_count: u64,
    /// Next due time for TIME entries; None once a one-shot has fired.
    pub next_due_ms: Option<i64>,
    /// Creation order, used for event-fire ordering.
    pub seq: u64,
}

impl ScheduleEntry {
    pub fn info(&self) -> EntryInfo {
        EntryInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.trigger.kind(),
            recurring: self.recurring,
            active: self.active,
            created_at_ms: self.created_at_ms,
            last_triggered_at_ms: self.last_triggered_at_ms,
            trigger_count: self.trigger_count,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryInfo {
    pub id: String,
    pub name: String,
    pub kind: TriggerKind,
    pub recurring: bool,
    pub active: bool,
    pub created_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_triggered_at_ms: Option<i64>,
    pub trigger_count: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub total: usize,
    pub active: usize,
    pub time_entries: usize,
    pub event_entries: usize,
    pub custom_entries: usize,
    pub total_triggers: u64,
}
