use murmur_core::Result;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

use crate::plugin::ConfigField;

/// Effective per-plugin configuration: schema defaults overlaid with the
/// plugin's user file.
#[derive(Debug, Clone, Default)]
pub struct PluginConfig {
    values: HashMap<String, Value>,
}

impl PluginConfig {
    /// Merge schema defaults with the user YAML file (a flat key/value map).
    /// Keys outside the schema are kept so plugins can read ad-hoc options.
    pub fn resolve(schema: &[ConfigField], user_file: &Path) -> Result<Self> {
        let mut values: HashMap<String, Value> = schema
            .iter()
            .map(|field| (field.key.clone(), field.default.clone()))
            .collect();

        if user_file.exists() {
            let content = std::fs::read_to_string(user_file)?;
            match serde_yaml::from_str::<HashMap<String, Value>>(&content) {
                Ok(user_values) => values.extend(user_values),
                Err(e) => {
                    warn!(file = %user_file.display(), error = %e, "Plugin config unreadable, using defaults");
                }
            }
        }
        Ok(Self { values })
    }

    pub fn from_values(values: HashMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Typed read with a fallback, the way plugin code consumes options.
    pub fn get_config<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.values
            .get(key)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(default)
    }
}
