use async_trait::async_trait;
use murmur_core::Result;
use std::sync::Arc;

/// Parameter map passed to every handler and direct listener of an event.
pub type EventParams = serde_json::Map<String, serde_json::Value>;

/// Build a param map from `(key, value)` pairs.
pub fn params_from(pairs: &[(&str, serde_json::Value)]) -> EventParams {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, params: &EventParams) -> Result<HandlerResult>;
}

#[derive(Debug, Clone)]
pub struct HandlerResult {
    pub success: bool,
    pub continue_process: bool,
    pub message: Option<String>,
    pub handler_name: String,
}

impl HandlerResult {
    pub fn ok(handler_name: &str) -> Self {
        Self {
            success: true,
            continue_process: true,
            message: None,
            handler_name: handler_name.to_string(),
        }
    }

    pub fn intercept(handler_name: &str, message: &str) -> Self {
        Self {
            success: true,
            continue_process: false,
            message: Some(message.to_string()),
            handler_name: handler_name.to_string(),
        }
    }

    pub fn failed(handler_name: &str, message: &str) -> Self {
        Self {
            success: false,
            continue_process: true,
            message: Some(message.to_string()),
            handler_name: handler_name.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct EventSubscription {
    pub event_name: String,
    pub handler_name: String,
    pub handler: Arc<dyn EventHandler>,
    pub weight: i32,
    pub intercept: bool,
    pub permission_group: String,
    pub plugin: String,
    /// Global subscription order, the tie-break for equal weights.
    pub(crate) order: u64,
}

#[derive(Debug, Clone, Default)]
pub struct AggregatedResult {
    pub results: Vec<HandlerResult>,
    pub all_success: bool,
    /// Index (within `results`) of the handler that stopped iteration.
    pub intercepted_at: Option<usize>,
}

impl AggregatedResult {
    pub fn intercepted(&self) -> bool {
        self.intercepted_at.is_some()
    }
}
