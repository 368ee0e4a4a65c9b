use murmur_bus::{route_fn, MessageRuntime};
use murmur_core::{Config, MessageEnvelope, Paths, Result};
use murmur_events::{params_from, EventManager};
use murmur_memory::MemoryEngine;
use murmur_plugins::builtin::PermissionPlugin;
use murmur_plugins::{
    ComponentRegistry, DependencyInstaller, DependencyResolver, NullInstaller, PermissionGate,
    Plugin, PluginHost,
};
use murmur_providers::{EmbeddingProvider, LanguageModel, VectorStore};
use murmur_scheduler::UnifiedScheduler;
use murmur_storage::{Database, GraphStore, PermissionStore, StreamStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::reply::ReplyGenerator;
use crate::streams::ChatStreamManager;

const STREAM_WINDOW: usize = 64;

/// Owns every subsystem. Replaces the source platform's global singletons:
/// everything is constructed here, passed down explicitly, and torn down in
/// reverse order on shutdown.
pub struct AppContext {
    pub config: Config,
    pub paths: Paths,
    pub events: Arc<EventManager>,
    pub scheduler: Arc<UnifiedScheduler>,
    pub runtime: Arc<MessageRuntime>,
    pub memory: Arc<MemoryEngine>,
    pub streams: Arc<ChatStreamManager>,
    pub host: Arc<PluginHost>,
    pub reply: Arc<ReplyGenerator>,
    pub permissions: Arc<PermissionStore>,
    shutdown_tx: broadcast::Sender<()>,
}

impl AppContext {
    /// Build and wire the whole core. `plugins` are loaded after the
    /// built-in ones; a missing installer disables dependency auto-install.
    pub async fn init(
        config: Config,
        paths: Paths,
        embedder: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorStore>,
        llm: Arc<dyn LanguageModel>,
        installer: Option<Arc<dyn DependencyInstaller>>,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<Arc<Self>> {
        paths.ensure_dirs()?;
        let db = Database::open(&paths.db_file())?;
        let graph = GraphStore::new(db.clone());
        let permissions = Arc::new(PermissionStore::new(db.clone()));
        let stream_store = StreamStore::new(db);

        let gate = Arc::new(PermissionGate::new(
            permissions.clone(),
            config.permission.clone(),
        ));
        let events = Arc::new(EventManager::new());
        let registry = Arc::new(ComponentRegistry::new());
        let resolver = DependencyResolver::new(
            config.dependency_management.clone(),
            installer.unwrap_or_else(|| Arc::new(NullInstaller)),
        );
        let host = Arc::new(PluginHost::new(
            registry,
            gate,
            events.clone(),
            resolver,
            paths.clone(),
        ));

        let scheduler = UnifiedScheduler::new(events.clone());
        let runtime = Arc::new(MessageRuntime::new(
            config.bus.queue_capacity,
            config.bus.overflow_policy,
            Duration::from_secs(config.bus.api_timeout_secs),
        ));

        let memory = MemoryEngine::new(
            config.three_tier_memory.clone(),
            &paths,
            graph,
            embedder,
            vectors,
            llm.clone(),
        );
        memory.replay_journals().await?;

        let streams = Arc::new(ChatStreamManager::new(STREAM_WINDOW, Some(stream_store)));
        let reply = ReplyGenerator::new(
            config.reply.clone(),
            llm,
            memory.clone(),
            streams.clone(),
            host.clone(),
            runtime.clone(),
        );

        // The one generic route: publish normal_message, then run the reply
        // path. Per-stream ordering comes from the runtime's stream workers.
        let route_events = events.clone();
        let route_reply = reply.clone();
        runtime.add_route(
            Arc::new(|_| true),
            route_fn(move |envelope: MessageEnvelope| {
                let events = route_events.clone();
                let reply = route_reply.clone();
                async move {
                    events
                        .trigger_event(
                            murmur_core::events::NORMAL_MESSAGE,
                            murmur_core::events::SYSTEM_GROUP,
                            params_from(&[
                                (
                                    "stream_id",
                                    serde_json::json!(envelope.stream_key().to_string()),
                                ),
                                ("platform", serde_json::json!(envelope.platform)),
                                (
                                    "user_id",
                                    serde_json::json!(envelope.message_info.user.user_id),
                                ),
                                ("message", serde_json::json!(envelope.plain_text())),
                            ]),
                        )
                        .await;
                    reply.handle_envelope(&envelope).await
                }
            }),
            "normal_message",
            None,
        );

        let mut all_plugins: Vec<Arc<dyn Plugin>> = vec![Arc::new(PermissionPlugin)];
        all_plugins.extend(plugins);
        host.load_all(all_plugins).await;

        let (shutdown_tx, _) = broadcast::channel(4);
        info!("Application context initialized");
        Ok(Arc::new(Self {
            config,
            paths,
            events,
            scheduler,
            runtime,
            memory,
            streams,
            host,
            reply,
            permissions,
            shutdown_tx,
        }))
    }

    /// Spawn the long-running subsystem loops.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let runtime = self.runtime.clone();
        let rx = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move { runtime.run(rx).await }));

        let scheduler = self.scheduler.clone();
        let rx = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move { scheduler.run(rx).await }));

        let memory = self.memory.clone();
        let rx = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move { memory.run(rx).await }));

        handles
    }

    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Shutdown cascade: stop accepting envelopes and drain (runtime loop),
    /// cancel the scheduler, flush memory staging, close adapters, then
    /// tear plugins down.
    pub async fn shutdown(&self) {
        info!("Shutting down");
        let _ = self.shutdown_tx.send(());
        // The runtime and memory loops handle drain/flush on the signal;
        // plugin teardown runs last so components stay valid while routed
        // work drains.
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.memory.flush().await;
        self.host.shutdown().await;
        info!("Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use murmur_bus::InProcessSink;
    use murmur_core::{Direction, MessageInfo, MessageKind, Segment, UserInfo};
    use murmur_events::EventParams;
    use murmur_plugins::{
        CommandArgs, CommandLike, ComponentContext, ComponentImpl, ComponentInfo, ComponentKind,
        PluginContext,
    };
    use murmur_providers::testing::{HashEmbedder, InMemoryVectorStore, ScriptedModel};
    use murmur_scheduler::{callback_fn, TriggerConfig};
    use tokio::sync::mpsc;

    struct ExamplePlugin;

    struct ExampleCommand;

    #[async_trait]
    impl CommandLike for ExampleCommand {
        fn verb(&self) -> &str {
            "example"
        }

        fn required_node(&self, args: &CommandArgs) -> Option<String> {
            match args.subcommand() {
                Some("admin") => Some("plugin.example.admin".to_string()),
                _ => None,
            }
        }

        async fn execute(
            &self,
            _ctx: &ComponentContext,
            _envelope: &MessageEnvelope,
            args: &CommandArgs,
        ) -> murmur_core::Result<Segment> {
            Ok(Segment::text(&format!(
                "example ran: {}",
                args.subcommand().unwrap_or("(none)")
            )))
        }
    }

    #[async_trait]
    impl Plugin for ExamplePlugin {
        fn name(&self) -> &str {
            "example"
        }

        fn components(&self) -> Vec<(ComponentInfo, ComponentImpl)> {
            vec![(
                ComponentInfo::new("example", ComponentKind::Command),
                ComponentImpl::Command(Arc::new(ExampleCommand)),
            )]
        }

        async fn on_load(&self, ctx: &PluginContext) -> murmur_core::Result<()> {
            ctx.permissions.store().register_node(
                "plugin.example.admin",
                self.name(),
                "example admin ops",
                false,
            )
        }
    }

    async fn context(model: Arc<ScriptedModel>, dir: &std::path::Path) -> Arc<AppContext> {
        AppContext::init(
            Config::default(),
            Paths::with_base(dir.to_path_buf()),
            Arc::new(HashEmbedder::default()),
            Arc::new(InMemoryVectorStore::new()),
            model,
            None,
            vec![Arc::new(ExamplePlugin)],
        )
        .await
        .unwrap()
    }

    fn private_envelope(user: &str, text: &str, id: &str) -> MessageEnvelope {
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

    #[tokio::test]
    async fn test_simple_reply_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedModel::new("hello to you too"));
        let ctx = context(model, dir.path()).await;

        let (outbound_tx, mut outbound_rx) = mpsc::channel(16);
        ctx.runtime.register_sink("qq", Arc::new(InProcessSink::new(outbound_tx)));
        let handles = ctx.start();

        ctx.runtime
            .push_incoming(private_envelope("1", "hello", "m1"))
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(2), outbound_rx.recv())
            .await
            .expect("reply arrives")
            .expect("channel open");
        assert_eq!(reply.direction, Direction::Outgoing);
        assert_eq!(reply.platform, "qq");
        assert_eq!(reply.stream_key().to_string(), "qq:private:1");
        assert_eq!(reply.plain_text(), "hello to you too");

        // Four more messages close a perceptual block.
        for i in 2..6 {
            ctx.runtime
                .push_incoming(private_envelope("1", "hello", &format!("m{}", i)))
                .await
                .unwrap();
            let _ = tokio::time::timeout(Duration::from_secs(2), outbound_rx.recv()).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = ctx.memory.stats().await.unwrap();
        assert!(stats.perceptual_blocks >= 1);

        ctx.shutdown().await;
        for handle in handles {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
    }

    #[tokio::test]
    async fn test_permission_denial_replies_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedModel::new("chat fallback"));
        let ctx = context(model, dir.path()).await;

        let (outbound_tx, mut outbound_rx) = mpsc::channel(16);
        ctx.runtime.register_sink("qq", Arc::new(InProcessSink::new(outbound_tx)));
        let handles = ctx.start();

        ctx.runtime
            .push_incoming(private_envelope("9", "/example admin", "m1"))
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(2), outbound_rx.recv())
            .await
            .expect("denial arrives")
            .expect("channel open");
        assert!(reply.plain_text().contains("permission"));
        // No state mutated: user 9 still holds nothing.
        assert!(ctx.permissions.list_user("qq", "9").unwrap().is_empty());

        // A granted user gets through.
        ctx.permissions.grant("qq", "9", "plugin.example.admin").unwrap();
        ctx.runtime
            .push_incoming(private_envelope("9", "/example admin", "m2"))
            .await
            .unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(2), outbound_rx.recv())
            .await
            .expect("reply arrives")
            .expect("channel open");
        assert_eq!(reply.plain_text(), "example ran: admin");

        ctx.shutdown().await;
        for handle in handles {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
    }

    #[tokio::test]
    async fn test_cold_start_schedule_fires_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedModel::new("unused"));
        let ctx = context(model, dir.path()).await;
        let handles = ctx.start();

        let (fired_tx, mut fired_rx) = mpsc::channel::<String>(1);
        ctx.scheduler
            .create(
                "proactive",
                TriggerConfig::event(murmur_core::events::PROACTIVE_INITIATION),
                true,
                callback_fn(move |params: EventParams| {
                    let fired_tx = fired_tx.clone();
                    async move {
                        let stream = params
                            .get("stream_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        let _ = fired_tx.send(stream).await;
                    }
                }),
                EventParams::new(),
            )
            .await
            .unwrap();

        ctx.events
            .trigger_event(
                murmur_core::events::PROACTIVE_INITIATION,
                murmur_core::events::SYSTEM_GROUP,
                params_from(&[("stream_id", serde_json::json!("qq:private:42"))]),
            )
            .await;

        let stream = tokio::time::timeout(Duration::from_millis(100), fired_rx.recv())
            .await
            .expect("callback fires without waiting for a tick")
            .expect("channel open");
        assert_eq!(stream, "qq:private:42");

        ctx.shutdown().await;
        for handle in handles {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
    }
}
