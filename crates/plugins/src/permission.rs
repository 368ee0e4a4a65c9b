use murmur_core::config::PermissionConfig;
use murmur_core::{Error, Result};
use murmur_storage::PermissionStore;
use std::sync::Arc;
use tracing::debug;

/// Permission middleware: every command and action invocation flows through
/// here before its implementation runs. Master users bypass all checks.
pub struct PermissionGate {
    store: Arc<PermissionStore>,
    masters: PermissionConfig,
}

impl PermissionGate {
    pub fn new(store: Arc<PermissionStore>, masters: PermissionConfig) -> Self {
        Self { store, masters }
    }

    pub fn store(&self) -> &Arc<PermissionStore> {
        &self.store
    }

    pub fn is_master(&self, platform: &str, user_id: &str) -> bool {
        self.masters.is_master(platform, user_id)
    }

    pub fn ensure(&self, platform: &str, user_id: &str, node: &str) -> Result<()> {
        if self.is_master(platform, user_id) {
            return Ok(());
        }
        if self.store.check(platform, user_id, node)? {
            return Ok(());
        }
        debug!(platform, user_id, node, "Permission check failed");
        Err(Error::PermissionDenied(node.to_string()))
    }

    /// Short user-facing denial text.
    pub fn denial_message(node: &str) -> String {
        format!("You don't have permission to do that (requires `{}`).", node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_storage::Database;

    fn gate(masters: Vec<(String, String)>) -> PermissionGate {
        let store = Arc::new(PermissionStore::new(Database::open_in_memory().unwrap()));
        store
            .register_node("plugin.example.admin", "example", "", false)
            .unwrap();
        PermissionGate::new(
            store,
            PermissionConfig {
                master_users: masters,
            },
        )
    }

    #[test]
    fn test_master_bypasses_checks() {
        let gate = gate(vec![("qq".to_string(), "1".to_string())]);
        assert!(gate.ensure("qq", "1", "plugin.example.admin").is_ok());
        assert!(matches!(
            gate.ensure("qq", "9", "plugin.example.admin"),
            Err(Error::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_granted_user_passes() {
        let gate = gate(vec![]);
        gate.store().grant("qq", "9", "plugin.example.admin").unwrap();
        assert!(gate.ensure("qq", "9", "plugin.example.admin").is_ok());
    }
}
