use async_trait::async_trait;
use murmur_core::{Paths, Result};
use murmur_events::{EventHandler, EventManager, EventParams, HandlerResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::component::{ComponentContext, ComponentImpl, EventHandlerLike};
use crate::config::PluginConfig;
use crate::deps::DependencyResolver;
use crate::permission::PermissionGate;
use crate::plugin::{Plugin, PluginContext, PluginManifest, PluginState};
use crate::registry::ComponentRegistry;

struct PluginEntry {
    plugin: Arc<dyn Plugin>,
    state: PluginState,
    config: Arc<PluginConfig>,
}

/// Loads plugins, resolves their dependencies, runs lifecycle hooks and
/// registers their components. One failing plugin never blocks the rest.
pub struct PluginHost {
    registry: Arc<ComponentRegistry>,
    gate: Arc<PermissionGate>,
    event_manager: Arc<EventManager>,
    resolver: DependencyResolver,
    paths: Paths,
    plugins: RwLock<HashMap<String, PluginEntry>>,
}

impl PluginHost {
    pub fn new(
        registry: Arc<ComponentRegistry>,
        gate: Arc<PermissionGate>,
        event_manager: Arc<EventManager>,
        resolver: DependencyResolver,
        paths: Paths,
    ) -> Self {
        Self {
            registry,
            gate,
            event_manager,
            resolver,
            paths,
            plugins: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn gate(&self) -> &Arc<PermissionGate> {
        &self.gate
    }

    /// Scan the plugins directory for manifests (`<name>.yaml` or
    /// `<name>/plugin.yaml`) controlling enablement of compiled-in plugins.
    pub fn discover_manifests(&self) -> Vec<PluginManifest> {
        let dir = self.paths.plugins_dir();
        let mut manifests = Vec::new();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return manifests;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let manifest_path = if path.is_dir() {
                path.join("plugin.yaml")
            } else if path.extension().map_or(false, |e| e == "yaml") {
                path
            } else {
                continue;
            };
            let Ok(content) = std::fs::read_to_string(&manifest_path) else {
                continue;
            };
            match serde_yaml::from_str::<PluginManifest>(&content) {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => {
                    warn!(path = %manifest_path.display(), error = %e, "Skipping invalid plugin manifest")
                }
            }
        }
        manifests
    }

    pub async fn load_all(&self, plugins: Vec<Arc<dyn Plugin>>) {
        let manifests: HashMap<String, PluginManifest> = self
            .discover_manifests()
            .into_iter()
            .map(|m| (m.name.clone(), m))
            .collect();

        for plugin in plugins {
            let name = plugin.name().to_string();
            let manifest_enabled = manifests.get(&name).map(|m| m.enabled).unwrap_or(true);
            if !plugin.enabled() || !manifest_enabled {
                info!(plugin = %name, "Plugin disabled, skipping");
                self.plugins.write().await.insert(
                    name,
                    PluginEntry {
                        plugin,
                        state: PluginState::Disabled,
                        config: Arc::new(PluginConfig::default()),
                    },
                );
                continue;
            }
            if let Err(e) = self.load_one(plugin.clone()).await {
                error!(plugin = %name, error = %e, "Plugin failed to load");
                self.registry.unregister_plugin(&name);
                self.event_manager.unsubscribe_plugin(&name).await;
                self.plugins.write().await.insert(
                    name,
                    PluginEntry {
                        plugin,
                        state: PluginState::Failed(e.to_string()),
                        config: Arc::new(PluginConfig::default()),
                    },
                );
            }
        }
    }

    async fn load_one(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let name = plugin.name().to_string();

        self.resolver.resolve(&name, &plugin.dependencies()).await?;

        let config = Arc::new(PluginConfig::resolve(
            &plugin.config_schema(),
            &self.paths.plugin_config_file(&name),
        )?);
        let ctx = PluginContext {
            config: config.clone(),
            permissions: self.gate.clone(),
        };

        plugin.on_load(&ctx).await?;
        self.plugins.write().await.insert(
            name.clone(),
            PluginEntry {
                plugin: plugin.clone(),
                state: PluginState::Loaded,
                config: config.clone(),
            },
        );

        for (info, implementation) in plugin.components() {
            if let ComponentImpl::EventHandler(handler) = &implementation {
                for spec in handler.subscriptions() {
                    self.event_manager
                        .subscribe(
                            &spec.event_name,
                            &info.name,
                            Arc::new(WrappedHandler(handler.clone())),
                            spec.weight,
                            spec.intercept,
                            &spec.permission_group,
                            &name,
                        )
                        .await;
                }
            }
            self.registry.register(&name, info, implementation)?;
        }

        plugin.on_enable(&ctx).await?;
        if let Some(entry) = self.plugins.write().await.get_mut(&name) {
            entry.state = PluginState::Enabled;
        }
        info!(plugin = %name, version = plugin.version(), "Plugin enabled");
        Ok(())
    }

    /// Invocation-time context for one plugin's components.
    pub async fn component_context(&self, plugin: &str) -> ComponentContext {
        let config = self
            .plugins
            .read()
            .await
            .get(plugin)
            .map(|entry| entry.config.clone())
            .unwrap_or_default();
        ComponentContext {
            plugin: plugin.to_string(),
            config,
            permissions: self.gate.clone(),
        }
    }

    pub async fn states(&self) -> Vec<(String, PluginState)> {
        let plugins = self.plugins.read().await;
        let mut states: Vec<(String, PluginState)> = plugins
            .iter()
            .map(|(name, entry)| (name.clone(), entry.state.clone()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Teardown in lifecycle order: disable, unload, unregister.
    pub async fn shutdown(&self) {
        let entries: Vec<(String, Arc<dyn Plugin>, PluginState)> = {
            let plugins = self.plugins.read().await;
            plugins
                .iter()
                .map(|(name, entry)| (name.clone(), entry.plugin.clone(), entry.state.clone()))
                .collect()
        };
        for (name, plugin, state) in entries {
            if state == PluginState::Enabled {
                if let Err(e) = plugin.on_disable().await {
                    warn!(plugin = %name, error = %e, "on_disable failed");
                }
            }
            if matches!(state, PluginState::Enabled | PluginState::Loaded) {
                if let Err(e) = plugin.on_unload().await {
                    warn!(plugin = %name, error = %e, "on_unload failed");
                }
            }
            self.registry.unregister_plugin(&name);
            self.event_manager.unsubscribe_plugin(&name).await;
        }
        self.plugins.write().await.clear();
        info!("Plugin host shut down");
    }
}

/// Bridges an event-handler component into the event manager's handler type.
struct WrappedHandler(Arc<dyn EventHandlerLike>);

#[async_trait]
impl EventHandler for WrappedHandler {
    async fn handle(&self, params: &EventParams) -> Result<HandlerResult> {
        self.0.handle(params).await
    }
}
