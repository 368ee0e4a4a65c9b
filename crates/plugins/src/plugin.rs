use async_trait::async_trait;
use murmur_core::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::component::{ComponentImpl, ComponentInfo};
use crate::config::PluginConfig;
use crate::permission::PermissionGate;

/// A declared runtime dependency of a plugin, resolved before `on_load`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDependency {
    pub import_name: String,
    /// Minimum acceptable version, if pinned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_req: Option<String>,
    /// Name handed to the installer when it differs from the import name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_name: Option<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub description: String,
}

impl PluginDependency {
    pub fn required(import_name: &str) -> Self {
        Self {
            import_name: import_name.to_string(),
            version_req: None,
            install_name: None,
            optional: false,
            description: String::new(),
        }
    }

    pub fn optional(import_name: &str) -> Self {
        Self {
            optional: true,
            ..Self::required(import_name)
        }
    }

    pub fn with_version(mut self, version_req: &str) -> Self {
        self.version_req = Some(version_req.to_string());
        self
    }

    pub fn install_name(&self) -> &str {
        self.install_name.as_deref().unwrap_or(&self.import_name)
    }
}

/// One typed option in a plugin's config schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigField {
    pub key: String,
    pub default: Value,
    pub description: String,
}

impl ConfigField {
    pub fn new(key: &str, default: Value, description: &str) -> Self {
        Self {
            key: key.to_string(),
            default,
            description: description.to_string(),
        }
    }
}

/// Services available to lifecycle hooks.
#[derive(Clone)]
pub struct PluginContext {
    pub config: Arc<PluginConfig>,
    pub permissions: Arc<PermissionGate>,
}

/// The plugin contract. Lifecycle runs
/// `on_load → on_enable → (runtime) → on_disable → on_unload`; async
/// initialization belongs in `on_enable`.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn enabled(&self) -> bool {
        true
    }

    fn config_schema(&self) -> Vec<ConfigField> {
        Vec::new()
    }

    fn dependencies(&self) -> Vec<PluginDependency> {
        Vec::new()
    }

    fn components(&self) -> Vec<(ComponentInfo, ComponentImpl)>;

    async fn on_load(&self, _ctx: &PluginContext) -> Result<()> {
        Ok(())
    }

    async fn on_enable(&self, _ctx: &PluginContext) -> Result<()> {
        Ok(())
    }

    async fn on_disable(&self) -> Result<()> {
        Ok(())
    }

    async fn on_unload(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Discovered,
    Loaded,
    Enabled,
    Disabled,
    Failed(String),
}

/// On-disk manifest overriding a compiled-in plugin's enablement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

fn default_true() -> bool {
    true
}
