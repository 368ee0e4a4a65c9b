use chrono::Utc;
use murmur_core::{Error, Result};
use murmur_events::{EventManager, EventParams};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::entry::{
    EntryInfo, ScheduleEntry, SchedulerStats, TaskCallback, TriggerConfig, TriggerKind,
};

/// Tick cadence is fixed at one second and not user-tunable.
pub const TICK_SECONDS: u64 = 1;

struct EventRegistration {
    listener_id: u64,
    subscriber_count: usize,
}

/// Fires callbacks when time, event or predicate conditions are met.
///
/// The entry map lives behind one async mutex; every tick snapshots due
/// entries under the lock and fires them concurrently outside it.
/// EVENT entries never poll: a direct listener at the event manager feeds
/// the fire queue the moment the event dispatches.
pub struct UnifiedScheduler {
    entries: Mutex<HashMap<String, ScheduleEntry>>,
    event_manager: Arc<EventManager>,
    event_registrations: Mutex<HashMap<String, EventRegistration>>,
    fire_tx: mpsc::UnboundedSender<(String, EventParams)>,
    fire_rx: Mutex<Option<mpsc::UnboundedReceiver<(String, EventParams)>>>,
    next_seq: AtomicU64,
}

impl UnifiedScheduler {
    pub fn new(event_manager: Arc<EventManager>) -> Arc<Self> {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            event_manager,
            event_registrations: Mutex::new(HashMap::new()),
            fire_tx,
            fire_rx: Mutex::new(Some(fire_rx)),
            next_seq: AtomicU64::new(1),
        })
    }

    pub async fn create(
        &self,
        name: &str,
        trigger: TriggerConfig,
        recurring: bool,
        callback: Arc<dyn TaskCallback>,
        bound_params: EventParams,
    ) -> Result<String> {
        let now_ms = Utc::now().timestamp_millis();
        let next_due_ms = match &trigger {
            TriggerConfig::Time {
                delay_seconds,
                trigger_at_ms,
                interval_seconds,
            } => match (delay_seconds, trigger_at_ms, interval_seconds) {
                (Some(delay), _, _) => Some(now_ms + (*delay as i64) * 1000),
                (None, Some(at), _) => Some(*at),
                (None, None, Some(interval)) if recurring => {
                    Some(now_ms + (*interval as i64) * 1000)
                }
                _ => {
                    return Err(Error::Scheduler(format!(
                        "time trigger for '{}' needs delay_seconds, trigger_at or a recurring interval",
                        name
                    )))
                }
            },
            TriggerConfig::Event { event_name } => {
                if event_name.is_empty() {
                    return Err(Error::Scheduler(format!(
                        "event trigger for '{}' needs an event name",
                        name
                    )));
                }
                None
            }
            TriggerConfig::Custom { .. } => None,
        };

        let id = uuid::Uuid::new_v4().to_string();
        if let TriggerConfig::Event { event_name } = &trigger {
            self.register_event_listener(event_name).await;
        }

        let entry = ScheduleEntry {
            id: id.clone(),
            name: name.to_string(),
            trigger,
            recurring,
            active: true,
            callback,
            bound_params,
            created_at_ms: now_ms,
            last_triggered_at_ms: None,
            trigger_count: 0,
            next_due_ms,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        debug!(id = %id, name, kind = entry.trigger.kind().as_str(), recurring, "Schedule entry created");
        self.entries.lock().await.insert(id.clone(), entry);
        Ok(id)
    }

    /// Cooperative removal: an in-flight callback is not interrupted.
    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.entries.lock().await.remove(id);
        match removed {
            Some(entry) => {
                if let TriggerConfig::Event { event_name } = &entry.trigger {
                    self.release_event_listener(event_name).await;
                }
                debug!(id, name = %entry.name, "Schedule entry removed");
                true
            }
            None => false,
        }
    }

    pub async fn pause(&self, id: &str) -> bool {
        self.set_active(id, false).await
    }

    pub async fn resume(&self, id: &str) -> bool {
        self.set_active(id, true).await
    }

    async fn set_active(&self, id: &str, active: bool) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(id) {
            Some(entry) => {
                entry.active = active;
                true
            }
            None => false,
        }
    }

    /// Force an immediate fire regardless of trigger state. A paused entry is
    /// woken: firing it by hand is an operator override, and a recurring
    /// entry left paused after a forced fire would be surprising.
    pub async fn trigger_now(&self, id: &str) -> Result<()> {
        let fired = {
            let mut entries = self.entries.lock().await;
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("schedule entry {}", id)))?;
            entry.active = true;
            entry.last_triggered_at_ms = Some(Utc::now().timestamp_millis());
            entry.trigger_count += 1;
            let fired = (entry.callback.clone(), entry.bound_params.clone(), entry.name.clone());
            if !entry.recurring {
                let entry = entries.remove(id).expect("entry present");
                if let TriggerConfig::Event { event_name } = &entry.trigger {
                    let event_name = event_name.clone();
                    drop(entries);
                    self.release_event_listener(&event_name).await;
                }
            }
            fired
        };
        let (callback, params, name) = fired;
        spawn_callback(id.to_string(), name, callback, params);
        Ok(())
    }

    pub async fn info(&self, id: &str) -> Option<EntryInfo> {
        self.entries.lock().await.get(id).map(|e| e.info())
    }

    pub async fn list(&self, kind: Option<TriggerKind>) -> Vec<EntryInfo> {
        let entries = self.entries.lock().await;
        let mut infos: Vec<EntryInfo> = entries
            .values()
            .filter(|e| kind.map_or(true, |k| e.trigger.kind() == k))
            .map(|e| e.info())
            .collect();
        infos.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms));
        infos
    }

    pub async fn stats(&self) -> SchedulerStats {
        let entries = self.entries.lock().await;
        let mut stats = SchedulerStats {
            total: entries.len(),
            ..Default::default()
        };
        for entry in entries.values() {
            if entry.active {
                stats.active += 1;
            }
            match entry.trigger.kind() {
                TriggerKind::Time => stats.time_entries += 1,
                TriggerKind::Event => stats.event_entries += 1,
                TriggerKind::Custom => stats.custom_entries += 1,
            }
            stats.total_triggers += entry.trigger_count;
        }
        stats
    }

    /// Run the tick loop until the shutdown signal arrives. Event fires are
    /// handled between ticks for zero latency.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!("Unified scheduler started");
        let mut fire_rx = self
            .fire_rx
            .lock()
            .await
            .take()
            .expect("scheduler run loop started twice");
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(TICK_SECONDS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_tick().await;
                }
                Some((event_name, params)) = fire_rx.recv() => {
                    self.fire_event_entries(&event_name, params).await;
                }
                _ = shutdown.recv() => {
                    info!("Unified scheduler shutting down");
                    break;
                }
            }
        }
    }

    /// One tick: snapshot due TIME/CUSTOM entries under the lock, update
    /// their bookkeeping, then fire them concurrently outside the lock.
    pub(crate) async fn run_tick(&self) {
        let now_ms = Utc::now().timestamp_millis();
        let mut due: Vec<(String, String, Arc<dyn TaskCallback>, EventParams)> = Vec::new();
        {
            let mut entries = self.entries.lock().await;
            let mut finished: Vec<String> = Vec::new();
            for entry in entries.values_mut() {
                if !entry.active {
                    continue;
                }
                let eligible = match &entry.trigger {
                    TriggerConfig::Time { .. } => {
                        entry.next_due_ms.map_or(false, |t| t <= now_ms)
                    }
                    TriggerConfig::Custom { condition } => evaluate_predicate(condition, &entry.name),
                    // EVENT entries are passive here; the direct listener path fires them.
                    TriggerConfig::Event { .. } => false,
                };
                if !eligible {
                    continue;
                }

                entry.last_triggered_at_ms = Some(now_ms);
                entry.trigger_count += 1;
                due.push((
                    entry.id.clone(),
                    entry.name.clone(),
                    entry.callback.clone(),
                    entry.bound_params.clone(),
                ));

                if entry.recurring {
                    if let TriggerConfig::Time {
                        interval_seconds: Some(interval),
                        ..
                    } = &entry.trigger
                    {
                        entry.next_due_ms = Some(now_ms + (*interval as i64) * 1000);
                    } else if matches!(entry.trigger, TriggerConfig::Time { .. }) {
                        // Recurring TIME without interval has nothing left to wait for.
                        entry.next_due_ms = None;
                    }
                } else {
                    finished.push(entry.id.clone());
                }
            }
            for id in finished {
                entries.remove(&id);
            }
        }

        for (id, name, callback, params) in due {
            spawn_callback(id, name, callback, params);
        }
    }

    /// Fire all active EVENT entries matching a dispatched event, in the
    /// order the entries were registered.
    async fn fire_event_entries(&self, event_name: &str, params: EventParams) {
        let now_ms = Utc::now().timestamp_millis();
        let mut matched: Vec<(String, String, Arc<dyn TaskCallback>, EventParams, u64)> = Vec::new();
        let mut released: Vec<String> = Vec::new();
        {
            let mut entries = self.entries.lock().await;
            let mut finished: Vec<String> = Vec::new();
            for entry in entries.values_mut() {
                let matches = matches!(
                    &entry.trigger,
                    TriggerConfig::Event { event_name: n } if n == event_name
                );
                if !matches || !entry.active {
                    continue;
                }
                entry.last_triggered_at_ms = Some(now_ms);
                entry.trigger_count += 1;

                // Event params override bound args on key collision.
                let mut merged = entry.bound_params.clone();
                for (k, v) in &params {
                    merged.insert(k.clone(), v.clone());
                }
                matched.push((
                    entry.id.clone(),
                    entry.name.clone(),
                    entry.callback.clone(),
                    merged,
                    entry.seq,
                ));
                if !entry.recurring {
                    finished.push(entry.id.clone());
                }
            }
            for id in finished {
                entries.remove(&id);
                released.push(event_name.to_string());
            }
        }
        for event in released {
            self.release_event_listener(&event).await;
        }

        matched.sort_by_key(|(_, _, _, _, seq)| *seq);
        debug!(event = event_name, count = matched.len(), "Event entries fired");
        for (id, name, callback, params, _) in matched {
            spawn_callback(id, name, callback, params);
        }
    }

    /// One direct listener per distinct event name, refcounted across entries.
    async fn register_event_listener(&self, event_name: &str) {
        let mut registrations = self.event_registrations.lock().await;
        if let Some(reg) = registrations.get_mut(event_name) {
            reg.subscriber_count += 1;
            return;
        }
        let fire_tx = self.fire_tx.clone();
        let listener_id = self
            .event_manager
            .register_direct_listener(
                event_name,
                Arc::new(move |name: &str, params: &EventParams| {
                    let _ = fire_tx.send((name.to_string(), params.clone()));
                }),
            )
            .await;
        registrations.insert(
            event_name.to_string(),
            EventRegistration {
                listener_id,
                subscriber_count: 1,
            },
        );
    }

    /// Removing the last subscriber for an event unregisters the listener.
    async fn release_event_listener(&self, event_name: &str) {
        let mut registrations = self.event_registrations.lock().await;
        let remove = match registrations.get_mut(event_name) {
            Some(reg) => {
                reg.subscriber_count = reg.subscriber_count.saturating_sub(1);
                reg.subscriber_count == 0
            }
            None => false,
        };
        if remove {
            if let Some(reg) = registrations.remove(event_name) {
                self.event_manager
                    .unregister_direct_listener(event_name, reg.listener_id)
                    .await;
            }
        }
    }
}

/// A predicate that panics counts as false for this tick.
fn evaluate_predicate(condition: &crate::entry::TaskPredicate, name: &str) -> bool {
    match std::panic::catch_unwind(AssertUnwindSafe(|| condition())) {
        Ok(result) => result,
        Err(_) => {
            warn!(entry = name, "Schedule predicate panicked; treating as false");
            false
        }
    }
}

/// Callbacks run detached; failures are logged with the entry identity and
/// swallowed so one bad task cannot poison the loop.
fn spawn_callback(
    id: String,
    name: String,
    callback: Arc<dyn TaskCallback>,
    params: EventParams,
) {
    tokio::spawn(async move {
        let outcome =
            futures::FutureExt::catch_unwind(AssertUnwindSafe(callback.run(params))).await;
        if outcome.is_err() {
            error!(entry_id = %id, entry_name = %name, "Schedule callback panicked");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::callback_fn;
    use murmur_core::events::SYSTEM_GROUP;
    use murmur_events::params_from;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counter_callback(counter: &Arc<AtomicUsize>) -> Arc<dyn TaskCallback> {
        let counter = counter.clone();
        callback_fn(move |_params| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[tokio::test]
    async fn test_time_entry_fires_once_and_is_removed() {
        let events = Arc::new(EventManager::new());
        let sched = UnifiedScheduler::new(events);
        let counter = Arc::new(AtomicUsize::new(0));
        let id = sched
            .create(
                "once",
                TriggerConfig::delay(0),
                false,
                counter_callback(&counter),
                EventParams::new(),
            )
            .await
            .unwrap();

        sched.run_tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(sched.info(&id).await.is_none());

        // Further ticks must not re-fire it.
        sched.run_tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recurring_interval_reschedules() {
        let events = Arc::new(EventManager::new());
        let sched = UnifiedScheduler::new(events);
        let counter = Arc::new(AtomicUsize::new(0));
        let id = sched
            .create(
                "heartbeat",
                TriggerConfig::Time {
                    delay_seconds: Some(0),
                    trigger_at_ms: None,
                    interval_seconds: Some(3600),
                },
                true,
                counter_callback(&counter),
                EventParams::new(),
            )
            .await
            .unwrap();

        sched.run_tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Rescheduled an hour out: the immediate next tick is a no-op.
        sched.run_tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(sched.info(&id).await.unwrap().trigger_count, 1);
    }

    #[tokio::test]
    async fn test_custom_predicate_controls_firing() {
        let events = Arc::new(EventManager::new());
        let sched = UnifiedScheduler::new(events);
        let counter = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let gate_clone = gate.clone();
        sched
            .create(
                "gated",
                TriggerConfig::custom(Arc::new(move || gate_clone.load(Ordering::SeqCst))),
                true,
                counter_callback(&counter),
                EventParams::new(),
            )
            .await
            .unwrap();

        sched.run_tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        gate.store(true, Ordering::SeqCst);
        sched.run_tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_event_entry_fires_through_direct_listener() {
        let events = Arc::new(EventManager::new());
        let sched = UnifiedScheduler::new(events.clone());
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen_clone = seen.clone();
        let id = sched
            .create(
                "on-proactive",
                TriggerConfig::event("ProactiveInitiationEvent"),
                true,
                callback_fn(move |params: EventParams| {
                    let seen = seen_clone.clone();
                    async move {
                        let stream = params
                            .get("stream_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        seen.lock().await.push(stream);
                    }
                }),
                EventParams::new(),
            )
            .await
            .unwrap();
        assert!(events.has_direct_listener("ProactiveInitiationEvent").await);

        // Drive the fire queue the way run() does.
        let sched_clone = sched.clone();
        let mut fire_rx = sched_clone.fire_rx.lock().await.take().unwrap();
        events
            .trigger_event(
                "ProactiveInitiationEvent",
                SYSTEM_GROUP,
                params_from(&[("stream_id", serde_json::json!("qq:private:42"))]),
            )
            .await;
        let (event_name, params) =
            tokio::time::timeout(Duration::from_millis(20), fire_rx.recv())
                .await
                .expect("listener enqueued within 20ms")
                .unwrap();
        sched.fire_event_entries(&event_name, params).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*seen.lock().await, vec!["qq:private:42".to_string()]);
        assert_eq!(sched.info(&id).await.unwrap().trigger_count, 1);

        // Removing the last subscriber removes the direct listener.
        assert!(sched.remove(&id).await);
        assert!(!events.has_direct_listener("ProactiveInitiationEvent").await);
    }

    #[tokio::test]
    async fn test_trigger_now_then_remove_matches_remove_alone() {
        let events = Arc::new(EventManager::new());
        let sched = UnifiedScheduler::new(events);
        let counter = Arc::new(AtomicUsize::new(0));
        let id = sched
            .create(
                "forced",
                TriggerConfig::delay(3600),
                true,
                counter_callback(&counter),
                EventParams::new(),
            )
            .await
            .unwrap();

        sched.trigger_now(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(sched.remove(&id).await);

        // No residue: ticks after removal never fire it again.
        sched.run_tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(sched.stats().await.total, 0);
    }

    #[tokio::test]
    async fn test_trigger_now_wakes_paused_entry() {
        let events = Arc::new(EventManager::new());
        let sched = UnifiedScheduler::new(events);
        let counter = Arc::new(AtomicUsize::new(0));
        let id = sched
            .create(
                "paused",
                TriggerConfig::delay(3600),
                true,
                counter_callback(&counter),
                EventParams::new(),
            )
            .await
            .unwrap();

        assert!(sched.pause(&id).await);
        sched.trigger_now(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(sched.info(&id).await.unwrap().active);
    }

    #[tokio::test]
    async fn test_paused_entry_skipped_on_tick() {
        let events = Arc::new(EventManager::new());
        let sched = UnifiedScheduler::new(events);
        let counter = Arc::new(AtomicUsize::new(0));
        let id = sched
            .create(
                "pausable",
                TriggerConfig::delay(0),
                false,
                counter_callback(&counter),
                EventParams::new(),
            )
            .await
            .unwrap();
        sched.pause(&id).await;
        sched.run_tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        sched.resume(&id).await;
        sched.run_tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stats_and_list_by_kind() {
        let events = Arc::new(EventManager::new());
        let sched = UnifiedScheduler::new(events);
        let counter = Arc::new(AtomicUsize::new(0));
        sched
            .create("t", TriggerConfig::delay(100), false, counter_callback(&counter), EventParams::new())
            .await
            .unwrap();
        sched
            .create("e", TriggerConfig::event("x"), true, counter_callback(&counter), EventParams::new())
            .await
            .unwrap();

        let stats = sched.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.time_entries, 1);
        assert_eq!(stats.event_entries, 1);
        assert_eq!(sched.list(Some(TriggerKind::Event)).await.len(), 1);
        assert_eq!(sched.list(None).await.len(), 2);
    }
}
