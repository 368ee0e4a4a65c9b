use futures::FutureExt;
use murmur_core::events::SYSTEM_GROUP;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::types::{AggregatedResult, EventHandler, EventParams, EventSubscription, HandlerResult};

/// Direct listeners bypass the handler chain: they run after dispatch with
/// the same params and cannot intercept. Used by the scheduler for
/// zero-latency event triggers.
pub type DirectListener = Arc<dyn Fn(&str, &EventParams) + Send + Sync>;

pub struct EventManager {
    subscriptions: RwLock<HashMap<String, Vec<EventSubscription>>>,
    direct_listeners: RwLock<HashMap<String, Vec<(u64, DirectListener)>>>,
    next_id: AtomicU64,
}

impl EventManager {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            direct_listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn subscribe(
        &self,
        event_name: &str,
        handler_name: &str,
        handler: Arc<dyn EventHandler>,
        weight: i32,
        intercept: bool,
        permission_group: &str,
        plugin: &str,
    ) {
        let order = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sub = EventSubscription {
            event_name: event_name.to_string(),
            handler_name: handler_name.to_string(),
            handler,
            weight,
            intercept,
            permission_group: permission_group.to_string(),
            plugin: plugin.to_string(),
            order,
        };
        debug!(event = event_name, handler = handler_name, weight, "Subscribed handler");
        self.subscriptions
            .write()
            .await
            .entry(event_name.to_string())
            .or_default()
            .push(sub);
    }

    /// Drop every subscription owned by a plugin (lifecycle teardown).
    pub async fn unsubscribe_plugin(&self, plugin: &str) {
        let mut subs = self.subscriptions.write().await;
        for handlers in subs.values_mut() {
            handlers.retain(|s| s.plugin != plugin);
        }
    }

    pub async fn subscriber_count(&self, event_name: &str) -> usize {
        self.subscriptions
            .read()
            .await
            .get(event_name)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Dispatch an event: handlers sorted by descending weight (stable on
    /// subscription order), permission-scoped, interceptable. Direct
    /// listeners run afterwards regardless of interception.
    pub async fn trigger_event(
        &self,
        event_name: &str,
        permission_group: &str,
        params: EventParams,
    ) -> AggregatedResult {
        let mut eligible: Vec<EventSubscription> = {
            let subs = self.subscriptions.read().await;
            subs.get(event_name)
                .map(|handlers| {
                    handlers
                        .iter()
                        .filter(|s| group_matches(permission_group, &s.permission_group))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        eligible.sort_by(|a, b| b.weight.cmp(&a.weight).then(a.order.cmp(&b.order)));

        let mut aggregated = AggregatedResult {
            results: Vec::with_capacity(eligible.len()),
            all_success: true,
            intercepted_at: None,
        };

        for sub in &eligible {
            let result = run_handler(sub, &params).await;
            if !result.success {
                aggregated.all_success = false;
                warn!(
                    event = event_name,
                    handler = %result.handler_name,
                    message = result.message.as_deref().unwrap_or(""),
                    "Event handler failed"
                );
            }
            let stop = !result.continue_process;
            aggregated.results.push(result);
            if stop {
                aggregated.intercepted_at = Some(aggregated.results.len() - 1);
                debug!(event = event_name, "Event intercepted");
                break;
            }
        }

        // Listeners observe every trigger, including intercepted ones.
        let listeners: Vec<DirectListener> = {
            let map = self.direct_listeners.read().await;
            map.get(event_name)
                .map(|v| v.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default()
        };
        for listener in listeners {
            listener(event_name, &params);
        }

        aggregated
    }

    /// Register a direct listener; returns a token for unregistering.
    pub async fn register_direct_listener(&self, event_name: &str, listener: DirectListener) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.direct_listeners
            .write()
            .await
            .entry(event_name.to_string())
            .or_default()
            .push((id, listener));
        debug!(event = event_name, id, "Registered direct listener");
        id
    }

    pub async fn unregister_direct_listener(&self, event_name: &str, id: u64) -> bool {
        let mut map = self.direct_listeners.write().await;
        if let Some(listeners) = map.get_mut(event_name) {
            let before = listeners.len();
            listeners.retain(|(lid, _)| *lid != id);
            if listeners.is_empty() {
                map.remove(event_name);
            }
            return before > 0;
        }
        false
    }

    pub async fn has_direct_listener(&self, event_name: &str) -> bool {
        self.direct_listeners.read().await.contains_key(event_name)
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

/// A SYSTEM trigger reaches every handler; a SYSTEM handler hears every
/// trigger; otherwise groups must match exactly.
fn group_matches(trigger_group: &str, handler_group: &str) -> bool {
    trigger_group == SYSTEM_GROUP || handler_group == SYSTEM_GROUP || trigger_group == handler_group
}

/// Run one handler, converting errors and panics into failed results so
/// iteration proceeds.
async fn run_handler(sub: &EventSubscription, params: &EventParams) -> HandlerResult {
    let outcome = AssertUnwindSafe(sub.handler.handle(params)).catch_unwind().await;
    match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => HandlerResult::failed(&sub.handler_name, &e.to_string()),
        Err(_) => HandlerResult::failed(&sub.handler_name, "handler panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        result: fn(&str) -> HandlerResult,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, _params: &EventParams) -> murmur_core::Result<HandlerResult> {
            self.log.lock().unwrap().push(self.name.clone());
            Ok((self.result)(&self.name))
        }
    }

    fn recorder(
        name: &str,
        log: &Arc<Mutex<Vec<String>>>,
        result: fn(&str) -> HandlerResult,
    ) -> Arc<dyn EventHandler> {
        Arc::new(Recorder {
            name: name.to_string(),
            log: log.clone(),
            result,
        })
    }

    #[tokio::test]
    async fn test_dispatch_orders_by_weight_then_subscription() {
        let mgr = EventManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        mgr.subscribe("e", "low", recorder("low", &log, HandlerResult::ok), 1, false, "SYSTEM", "p").await;
        mgr.subscribe("e", "high", recorder("high", &log, HandlerResult::ok), 10, false, "SYSTEM", "p").await;
        mgr.subscribe("e", "tie_a", recorder("tie_a", &log, HandlerResult::ok), 5, false, "SYSTEM", "p").await;
        mgr.subscribe("e", "tie_b", recorder("tie_b", &log, HandlerResult::ok), 5, false, "SYSTEM", "p").await;

        let result = mgr.trigger_event("e", "SYSTEM", EventParams::new()).await;
        assert!(result.all_success);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["high", "tie_a", "tie_b", "low"]
        );
    }

    #[tokio::test]
    async fn test_intercept_stops_iteration() {
        let mgr = EventManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        mgr.subscribe(
            "e",
            "stopper",
            recorder("stopper", &log, |n| HandlerResult::intercept(n, "handled")),
            10,
            true,
            "SYSTEM",
            "p",
        )
        .await;
        mgr.subscribe("e", "after", recorder("after", &log, HandlerResult::ok), 1, false, "SYSTEM", "p").await;

        let result = mgr.trigger_event("e", "SYSTEM", EventParams::new()).await;
        assert_eq!(result.intercepted_at, Some(0));
        assert_eq!(*log.lock().unwrap(), vec!["stopper"]);
    }

    #[tokio::test]
    async fn test_failed_handler_does_not_stop_iteration() {
        let mgr = EventManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        mgr.subscribe(
            "e",
            "bad",
            recorder("bad", &log, |n| HandlerResult::failed(n, "boom")),
            10,
            false,
            "SYSTEM",
            "p",
        )
        .await;
        mgr.subscribe("e", "good", recorder("good", &log, HandlerResult::ok), 1, false, "SYSTEM", "p").await;

        let result = mgr.trigger_event("e", "SYSTEM", EventParams::new()).await;
        assert!(!result.all_success);
        assert!(!result.intercepted());
        assert_eq!(result.results.len(), 2);
    }

    #[tokio::test]
    async fn test_permission_group_scoping() {
        let mgr = EventManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        mgr.subscribe("e", "admin_only", recorder("admin_only", &log, HandlerResult::ok), 0, false, "admin", "p").await;
        mgr.subscribe("e", "open", recorder("open", &log, HandlerResult::ok), 0, false, "SYSTEM", "p").await;

        // Non-matching group reaches only the SYSTEM handler.
        mgr.trigger_event("e", "user", EventParams::new()).await;
        assert_eq!(*log.lock().unwrap(), vec!["open"]);

        log.lock().unwrap().clear();
        // SYSTEM trigger reaches everything.
        mgr.trigger_event("e", "SYSTEM", EventParams::new()).await;
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_direct_listener_sees_intercepted_events() {
        let mgr = EventManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        mgr.subscribe(
            "e",
            "stopper",
            recorder("stopper", &log, |n| HandlerResult::intercept(n, "stop")),
            0,
            true,
            "SYSTEM",
            "p",
        )
        .await;

        let seen = Arc::new(Mutex::new(0usize));
        let seen_clone = seen.clone();
        let id = mgr
            .register_direct_listener(
                "e",
                Arc::new(move |_, _| {
                    *seen_clone.lock().unwrap() += 1;
                }),
            )
            .await;

        mgr.trigger_event("e", "SYSTEM", EventParams::new()).await;
        assert_eq!(*seen.lock().unwrap(), 1);

        assert!(mgr.unregister_direct_listener("e", id).await);
        assert!(!mgr.has_direct_listener("e").await);
        mgr.trigger_event("e", "SYSTEM", EventParams::new()).await;
        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
