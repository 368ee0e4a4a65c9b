use chrono::Utc;
use murmur_core::Result;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::Database;
use crate::graph::storage_err;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionNode {
    pub node_name: String,
    pub plugin: String,
    pub description: String,
    pub default_grant: bool,
}

/// Permission nodes plus per-user grants, backing the permission middleware
/// and the `permission` command.
#[derive(Clone)]
pub struct PermissionStore {
    db: Database,
}

impl PermissionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Declare a node. Re-registration refreshes plugin/description but never
    /// clobbers an operator-tuned default grant.
    pub fn register_node(
        &self,
        node_name: &str,
        plugin: &str,
        description: &str,
        default_grant: bool,
    ) -> Result<()> {
        self.db
            .lock()?
            .execute(
                "INSERT INTO permission_nodes (node_name, plugin, description, default_grant)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(node_name) DO UPDATE SET
                    plugin = excluded.plugin,
                    description = excluded.description",
                params![node_name, plugin, description, default_grant as i64],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn nodes(&self) -> Result<Vec<PermissionNode>> {
        let guard = self.db.lock()?;
        let mut stmt = guard
            .prepare(
                "SELECT node_name, plugin, description, default_grant
                 FROM permission_nodes ORDER BY node_name",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PermissionNode {
                    node_name: row.get(0)?,
                    plugin: row.get(1)?,
                    description: row.get(2)?,
                    default_grant: row.get::<_, i64>(3)? != 0,
                })
            })
            .map_err(storage_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(storage_err)
    }

    pub fn grant(&self, platform: &str, user_id: &str, node_name: &str) -> Result<()> {
        debug!(platform, user_id, node = node_name, "Permission granted");
        self.db
            .lock()?
            .execute(
                "INSERT OR REPLACE INTO user_permissions (platform, user_id, node_name, granted_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![platform, user_id, node_name, Utc::now().to_rfc3339()],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn revoke(&self, platform: &str, user_id: &str, node_name: &str) -> Result<bool> {
        let changed = self
            .db
            .lock()?
            .execute(
                "DELETE FROM user_permissions WHERE platform = ?1 AND user_id = ?2 AND node_name = ?3",
                params![platform, user_id, node_name],
            )
            .map_err(storage_err)?;
        Ok(changed > 0)
    }

    /// Explicit grant wins; otherwise the node's default grant applies.
    /// Unknown nodes deny.
    pub fn check(&self, platform: &str, user_id: &str, node_name: &str) -> Result<bool> {
        let guard = self.db.lock()?;
        let granted: Option<i64> = guard
            .query_row(
                "SELECT 1 FROM user_permissions WHERE platform = ?1 AND user_id = ?2 AND node_name = ?3",
                params![platform, user_id, node_name],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        if granted.is_some() {
            return Ok(true);
        }
        let default_grant: Option<i64> = guard
            .query_row(
                "SELECT default_grant FROM permission_nodes WHERE node_name = ?1",
                params![node_name],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        Ok(default_grant.map(|d| d != 0).unwrap_or(false))
    }

    pub fn list_user(&self, platform: &str, user_id: &str) -> Result<Vec<String>> {
        let guard = self.db.lock()?;
        let mut stmt = guard
            .prepare(
                "SELECT node_name FROM user_permissions
                 WHERE platform = ?1 AND user_id = ?2 ORDER BY node_name",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![platform, user_id], |row| row.get::<_, String>(0))
            .map_err(storage_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(storage_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PermissionStore {
        PermissionStore::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn test_check_uses_grant_then_default() {
        let perms = store();
        perms
            .register_node("plugin.example.admin", "example", "admin ops", false)
            .unwrap();
        perms
            .register_node("plugin.example.use", "example", "basic use", true)
            .unwrap();

        assert!(!perms.check("qq", "9", "plugin.example.admin").unwrap());
        assert!(perms.check("qq", "9", "plugin.example.use").unwrap());
        assert!(!perms.check("qq", "9", "plugin.unknown.node").unwrap());

        perms.grant("qq", "9", "plugin.example.admin").unwrap();
        assert!(perms.check("qq", "9", "plugin.example.admin").unwrap());

        assert!(perms.revoke("qq", "9", "plugin.example.admin").unwrap());
        assert!(!perms.check("qq", "9", "plugin.example.admin").unwrap());
        assert!(!perms.revoke("qq", "9", "plugin.example.admin").unwrap());
    }

    #[test]
    fn test_list_and_nodes() {
        let perms = store();
        perms.register_node("a.x", "a", "", false).unwrap();
        perms.register_node("a.y", "a", "", false).unwrap();
        perms.grant("qq", "1", "a.y").unwrap();
        perms.grant("qq", "1", "a.x").unwrap();

        assert_eq!(perms.list_user("qq", "1").unwrap(), vec!["a.x", "a.y"]);
        assert_eq!(perms.nodes().unwrap().len(), 2);
        assert!(perms.list_user("qq", "2").unwrap().is_empty());
    }
}
