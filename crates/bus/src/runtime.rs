use async_trait::async_trait;
use futures::FutureExt;
use murmur_core::{Error, MessageEnvelope, MessageKind, OverflowPolicy, Result, StreamKey};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::sink::AdapterSink;

pub type RoutePredicate = Arc<dyn Fn(&MessageEnvelope) -> bool + Send + Sync>;

#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn handle(&self, envelope: &MessageEnvelope) -> Result<()>;
}

struct FnRouteHandler<F>(F);

#[async_trait]
impl<F, Fut> RouteHandler for FnRouteHandler<F>
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    async fn handle(&self, envelope: &MessageEnvelope) -> Result<()> {
        (self.0)(envelope.clone()).await
    }
}

/// Wrap an async closure as a route handler.
pub fn route_fn<F, Fut>(f: F) -> Arc<dyn RouteHandler>
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnRouteHandler(f))
}

/// Before-hooks run in registration order; `Err(SkipMessage)` aborts the
/// envelope without treating it as a fault.
pub type BeforeHook = Arc<dyn Fn(&MessageEnvelope) -> Result<()> + Send + Sync>;
pub type AfterHook = Arc<dyn Fn(&MessageEnvelope) + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&MessageEnvelope, &Error) + Send + Sync>;

struct Route {
    name: String,
    predicate: RoutePredicate,
    handler: Arc<dyn RouteHandler>,
    message_type: Option<MessageKind>,
    event_route: bool,
}

struct RuntimeShared {
    routes: RwLock<Vec<Route>>,
    before_hooks: RwLock<Vec<BeforeHook>>,
    after_hooks: RwLock<Vec<AfterHook>>,
    error_hooks: RwLock<Vec<ErrorHook>>,
    sinks: RwLock<HashMap<String, Arc<dyn AdapterSink>>>,
    api_timeout: Duration,
    inflight: AtomicUsize,
}

impl RuntimeShared {
    /// Route one envelope: before-hooks, first matching route by priority
    /// class, after-hooks. Faults reach the error hooks and are swallowed so
    /// routing continues for subsequent envelopes.
    async fn dispatch_one(&self, envelope: MessageEnvelope) {
        let before = self.before_hooks.read().expect("hook lock").clone();
        for hook in before {
            match hook(&envelope) {
                Ok(()) => {}
                Err(Error::SkipMessage) => {
                    info!(message_id = %envelope.message_id, "Envelope skipped by before-hook");
                    return;
                }
                Err(e) => {
                    self.emit_error(&envelope, &e);
                    return;
                }
            }
        }

        let selected = self.select_route(&envelope);
        match selected {
            None => debug!(message_id = %envelope.message_id, "No route matched"),
            Some((name, handler)) => {
                let outcome =
                    AssertUnwindSafe(handler.handle(&envelope)).catch_unwind().await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => self.emit_error(&envelope, &e),
                    Err(_) => self.emit_error(
                        &envelope,
                        &Error::HandlerFault(format!("route '{}' panicked", name)),
                    ),
                }
            }
        }

        let after = self.after_hooks.read().expect("hook lock").clone();
        for hook in after {
            hook(&envelope);
        }
    }

    /// Priority: routes with a matching message type, then event routes for
    /// notice/meta envelopes, then generic routes. First match within a
    /// class wins, in registration order.
    fn select_route(&self, envelope: &MessageEnvelope) -> Option<(String, Arc<dyn RouteHandler>)> {
        let routes = self.routes.read().expect("route lock");
        let kind = envelope.message_info.message_type;
        let is_event_envelope = matches!(kind, MessageKind::Notice | MessageKind::Meta);

        for route in routes.iter() {
            if route.message_type == Some(kind) && (route.predicate)(envelope) {
                return Some((route.name.clone(), route.handler.clone()));
            }
        }
        if is_event_envelope {
            for route in routes.iter() {
                if route.event_route && (route.predicate)(envelope) {
                    return Some((route.name.clone(), route.handler.clone()));
                }
            }
        }
        for route in routes.iter() {
            if route.message_type.is_none() && !route.event_route && (route.predicate)(envelope) {
                return Some((route.name.clone(), route.handler.clone()));
            }
        }
        None
    }

    fn emit_error(&self, envelope: &MessageEnvelope, e: &Error) {
        match e {
            Error::SkipMessage => {
                info!(message_id = %envelope.message_id, "Envelope skipped")
            }
            _ => error!(
                message_id = %envelope.message_id,
                stream = %envelope.stream_key(),
                error = %e,
                "Route handler fault"
            ),
        }
        let hooks = self.error_hooks.read().expect("hook lock").clone();
        for hook in hooks {
            hook(envelope, e);
        }
    }
}

/// Cheap clonable ingress handle given to adapters and sinks. Applies the
/// configured overflow policy at the bounded inbound queue.
#[derive(Clone)]
pub struct RuntimeHandle {
    inbound_tx: mpsc::Sender<MessageEnvelope>,
    overflow: OverflowPolicy,
    accepting: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl RuntimeHandle {
    /// Enqueue an inbound envelope. Returns once enqueued; handler work
    /// happens on the dispatcher, never here.
    pub async fn push_incoming(&self, envelope: MessageEnvelope) -> Result<()> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::Other("runtime is shutting down".to_string()));
        }
        match self.overflow {
            OverflowPolicy::Block => self
                .inbound_tx
                .send(envelope)
                .await
                .map_err(|_| Error::Other("runtime inbound queue closed".to_string())),
            OverflowPolicy::Drop => match self.inbound_tx.try_send(envelope) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(env)) => {
                    let count = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        stream = %env.stream_key(),
                        dropped_total = count,
                        "Inbound queue full, dropping envelope"
                    );
                    Err(Error::BufferFull(env.stream_key().to_string()))
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    Err(Error::Other("runtime inbound queue closed".to_string()))
                }
            },
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Routes inbound envelopes to handlers with a per-stream serial guarantee
/// and dispatches outbound envelopes to registered adapter sinks.
pub struct MessageRuntime {
    handle: RuntimeHandle,
    inbound_rx: Mutex<Option<mpsc::Receiver<MessageEnvelope>>>,
    shared: Arc<RuntimeShared>,
}

impl MessageRuntime {
    pub fn new(queue_capacity: usize, overflow: OverflowPolicy, api_timeout: Duration) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(queue_capacity);
        Self {
            handle: RuntimeHandle {
                inbound_tx,
                overflow,
                accepting: Arc::new(AtomicBool::new(true)),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            inbound_rx: Mutex::new(Some(inbound_rx)),
            shared: Arc::new(RuntimeShared {
                routes: RwLock::new(Vec::new()),
                before_hooks: RwLock::new(Vec::new()),
                after_hooks: RwLock::new(Vec::new()),
                error_hooks: RwLock::new(Vec::new()),
                sinks: RwLock::new(HashMap::new()),
                api_timeout,
                inflight: AtomicUsize::new(0),
            }),
        }
    }

    pub fn handle(&self) -> RuntimeHandle {
        self.handle.clone()
    }

    pub async fn push_incoming(&self, envelope: MessageEnvelope) -> Result<()> {
        self.handle.push_incoming(envelope).await
    }

    pub fn add_route(
        &self,
        predicate: RoutePredicate,
        handler: Arc<dyn RouteHandler>,
        name: &str,
        message_type: Option<MessageKind>,
    ) {
        debug!(route = name, ?message_type, "Route registered");
        self.shared.routes.write().expect("route lock").push(Route {
            name: name.to_string(),
            predicate,
            handler,
            message_type,
            event_route: false,
        });
    }

    /// Register a route for notice/meta envelopes (platform events).
    pub fn add_event_route(
        &self,
        predicate: RoutePredicate,
        handler: Arc<dyn RouteHandler>,
        name: &str,
    ) {
        debug!(route = name, "Event route registered");
        self.shared.routes.write().expect("route lock").push(Route {
            name: name.to_string(),
            predicate,
            handler,
            message_type: None,
            event_route: true,
        });
    }

    pub fn register_before_hook(&self, hook: BeforeHook) {
        self.shared.before_hooks.write().expect("hook lock").push(hook);
    }

    pub fn register_after_hook(&self, hook: AfterHook) {
        self.shared.after_hooks.write().expect("hook lock").push(hook);
    }

    pub fn register_error_hook(&self, hook: ErrorHook) {
        self.shared.error_hooks.write().expect("hook lock").push(hook);
    }

    pub fn register_sink(&self, platform: &str, sink: Arc<dyn AdapterSink>) {
        info!(platform, "Adapter sink registered");
        self.shared
            .sinks
            .write()
            .expect("sink lock")
            .insert(platform.to_string(), sink);
    }

    pub fn unregister_sink(&self, platform: &str) -> bool {
        self.shared
            .sinks
            .write()
            .expect("sink lock")
            .remove(platform)
            .is_some()
    }

    fn sink_for(&self, platform: &str) -> Result<Arc<dyn AdapterSink>> {
        self.shared
            .sinks
            .read()
            .expect("sink lock")
            .get(platform)
            .cloned()
            .ok_or_else(|| Error::NoAdapterForPlatform(platform.to_string()))
    }

    /// Hand an outbound envelope to the sink registered for its platform.
    /// Send failures propagate to the caller.
    pub async fn send_outgoing(&self, envelope: &MessageEnvelope) -> Result<()> {
        let sink = self.sink_for(&envelope.platform)?;
        sink.send(envelope).await
    }

    /// Issue a platform API call through the registered sink, bounded by the
    /// configured timeout.
    pub async fn call_api(
        &self,
        platform: &str,
        action: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let sink = self.sink_for(platform)?;
        sink.call_api(action, params, self.shared.api_timeout).await
    }

    /// Run the dispatcher until shutdown: envelopes fan out to one worker per
    /// stream, so each stream processes strictly in arrival order while
    /// streams stay concurrent with each other.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("Message runtime started");
        let mut inbound_rx = self
            .inbound_rx
            .lock()
            .await
            .take()
            .expect("runtime run loop started twice");
        let mut workers: HashMap<StreamKey, mpsc::UnboundedSender<MessageEnvelope>> =
            HashMap::new();

        loop {
            tokio::select! {
                maybe_env = inbound_rx.recv() => {
                    let Some(envelope) = maybe_env else { break };
                    let key = envelope.stream_key();
                    let worker = workers.entry(key.clone()).or_insert_with(|| {
                        spawn_stream_worker(key, self.shared.clone())
                    });
                    self.shared.inflight.fetch_add(1, Ordering::SeqCst);
                    if worker.send(envelope).is_err() {
                        self.shared.inflight.fetch_sub(1, Ordering::SeqCst);
                    }
                }
                _ = shutdown.recv() => {
                    info!("Message runtime draining");
                    break;
                }
            }
        }

        // Stop accepting, let per-stream workers drain with a deadline.
        self.handle.accepting.store(false, Ordering::SeqCst);
        drop(workers);
        if !self.wait_idle(Duration::from_secs(10)).await {
            warn!("Drain deadline reached with route work still in flight");
        }
        self.close_sinks().await;
        info!("Message runtime stopped");
    }

    async fn wait_idle(&self, deadline: Duration) -> bool {
        let start = tokio::time::Instant::now();
        while self.shared.inflight.load(Ordering::SeqCst) > 0 {
            if start.elapsed() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }

    async fn close_sinks(&self) {
        let sinks: Vec<Arc<dyn AdapterSink>> = {
            let map = self.shared.sinks.read().expect("sink lock");
            map.values().cloned().collect()
        };
        for sink in sinks {
            if let Err(e) = sink.close().await {
                warn!(error = %e, "Adapter sink close failed");
            }
        }
    }
}

fn spawn_stream_worker(
    key: StreamKey,
    shared: Arc<RuntimeShared>,
) -> mpsc::UnboundedSender<MessageEnvelope> {
    let (tx, mut rx) = mpsc::unbounded_channel::<MessageEnvelope>();
    tokio::spawn(async move {
        debug!(stream = %key, "Stream worker started");
        while let Some(envelope) = rx.recv().await {
            shared.dispatch_one(envelope).await;
            shared.inflight.fetch_sub(1, Ordering::SeqCst);
        }
        debug!(stream = %key, "Stream worker stopped");
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_core::{MessageInfo, Segment, UserInfo};
    use std::sync::Mutex as StdMutex;

    fn envelope(user: &str, text: &str, id: &str) -> MessageEnvelope {
        MessageEnvelope::incoming(
            "qq",
            id,
            MessageInfo {
                message_type: MessageKind::Private,
                user: UserInfo::new(user),
                group: None,
                self_id: "bot".to_string(),
                to_me: true,
            },
            Segment::text(text),
        )
    }

    fn runtime() -> MessageRuntime {
        MessageRuntime::new(16, OverflowPolicy::Drop, Duration::from_secs(10))
    }

    fn any_route() -> RoutePredicate {
        Arc::new(|_| true)
    }

    #[tokio::test]
    async fn test_per_stream_order_preserved() {
        let rt = runtime();
        let seen: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = seen.clone();
        rt.add_route(
            any_route(),
            route_fn(move |env: MessageEnvelope| {
                let seen = seen_clone.clone();
                async move {
                    seen.lock().unwrap().push(env.plain_text());
                    Ok(())
                }
            }),
            "collect",
            None,
        );

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        for i in 0..10 {
            rt.push_incoming(envelope("1", &format!("m{}", i), &format!("id{}", i)))
                .await
                .unwrap();
        }
        let run = rt.run(shutdown_rx);
        tokio::pin!(run);
        tokio::select! {
            _ = &mut run => {}
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }
        let _ = shutdown_tx.send(());
        run.await;

        let observed = seen.lock().unwrap().clone();
        let expected: Vec<String> = (0..10).map(|i| format!("m{}", i)).collect();
        assert_eq!(observed, expected);
    }

    #[tokio::test]
    async fn test_skip_message_aborts_without_fault() {
        let rt = runtime();
        let handled = Arc::new(AtomicUsize::new(0));
        let faulted = Arc::new(AtomicUsize::new(0));

        rt.register_before_hook(Arc::new(|env| {
            if env.plain_text().contains("skip") {
                Err(Error::SkipMessage)
            } else {
                Ok(())
            }
        }));
        let faulted_clone = faulted.clone();
        rt.register_error_hook(Arc::new(move |_, _| {
            faulted_clone.fetch_add(1, Ordering::SeqCst);
        }));
        let handled_clone = handled.clone();
        rt.add_route(
            any_route(),
            route_fn(move |_| {
                let handled = handled_clone.clone();
                async move {
                    handled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            "count",
            None,
        );

        rt.shared.dispatch_one(envelope("1", "please skip me", "a")).await;
        rt.shared.dispatch_one(envelope("1", "process me", "b")).await;
        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert_eq!(faulted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_fault_reaches_error_hook_and_routing_continues() {
        let rt = runtime();
        let errors: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let errors_clone = errors.clone();
        rt.register_error_hook(Arc::new(move |_, e| {
            errors_clone.lock().unwrap().push(e.to_string());
        }));
        rt.add_route(
            any_route(),
            route_fn(|env: MessageEnvelope| async move {
                if env.plain_text() == "bad" {
                    Err(Error::HandlerFault("boom".to_string()))
                } else {
                    Ok(())
                }
            }),
            "maybe-fail",
            None,
        );

        rt.shared.dispatch_one(envelope("1", "bad", "a")).await;
        rt.shared.dispatch_one(envelope("1", "fine", "b")).await;
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_route_priority_typed_over_generic() {
        let rt = runtime();
        let chosen: Arc<StdMutex<Vec<&'static str>>> = Arc::new(StdMutex::new(Vec::new()));
        let c1 = chosen.clone();
        rt.add_route(
            any_route(),
            route_fn(move |_| {
                let c = c1.clone();
                async move {
                    c.lock().unwrap().push("generic");
                    Ok(())
                }
            }),
            "generic",
            None,
        );
        let c2 = chosen.clone();
        rt.add_route(
            any_route(),
            route_fn(move |_| {
                let c = c2.clone();
                async move {
                    c.lock().unwrap().push("typed");
                    Ok(())
                }
            }),
            "typed",
            Some(MessageKind::Private),
        );

        rt.shared.dispatch_one(envelope("1", "x", "a")).await;
        assert_eq!(*chosen.lock().unwrap(), vec!["typed"]);
    }

    #[tokio::test]
    async fn test_drop_policy_surfaces_buffer_full() {
        let rt = MessageRuntime::new(1, OverflowPolicy::Drop, Duration::from_secs(10));
        rt.push_incoming(envelope("1", "first", "a")).await.unwrap();
        let second = rt.push_incoming(envelope("1", "second", "b")).await;
        assert!(matches!(second, Err(Error::BufferFull(_))));
        assert_eq!(rt.handle().dropped_count(), 1);
    }

    #[tokio::test]
    async fn test_send_outgoing_without_sink_fails() {
        let rt = runtime();
        let env = envelope("1", "hi", "a").reply_with(Segment::text("hello"));
        assert!(matches!(
            rt.send_outgoing(&env).await,
            Err(Error::NoAdapterForPlatform(p)) if p == "qq"
        ));
    }
}
