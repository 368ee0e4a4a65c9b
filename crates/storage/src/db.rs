use murmur_core::{Error, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Shared SQLite handle. WAL mode for concurrent readers; all stores clone
/// the same connection guard.
#[derive(Clone)]
pub struct Database {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Storage(format!("Failed to create db directory: {}", e))
            })?;
        }
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Storage(format!("Failed to open database: {}", e)))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        debug!(path = %db_path.display(), "Database opened");
        Ok(db)
    }

    /// Private in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to open in-memory db: {}", e)))?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS memory_nodes (
                id            TEXT PRIMARY KEY,
                content       TEXT NOT NULL,
                node_type     TEXT NOT NULL,
                has_embedding INTEGER NOT NULL DEFAULT 0,
                created_at    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_nodes_content ON memory_nodes(content);

            CREATE TABLE IF NOT EXISTS memory_edges (
                id         TEXT PRIMARY KEY,
                source_id  TEXT NOT NULL,
                target_id  TEXT NOT NULL,
                relation   TEXT NOT NULL,
                edge_type  TEXT NOT NULL,
                importance REAL NOT NULL DEFAULT 0.5,
                metadata   TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_edges_source ON memory_edges(source_id);
            CREATE INDEX IF NOT EXISTS idx_edges_target ON memory_edges(target_id);

            CREATE TABLE IF NOT EXISTS long_term_memories (
                id            TEXT PRIMARY KEY,
                subject_id    TEXT NOT NULL,
                memory_type   TEXT NOT NULL,
                node_ids      TEXT NOT NULL,
                edge_ids      TEXT NOT NULL,
                importance    REAL NOT NULL DEFAULT 0.5,
                access_count  INTEGER NOT NULL DEFAULT 0,
                last_accessed TEXT NOT NULL,
                decay_factor  REAL NOT NULL DEFAULT 1.0,
                created_at    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_ltm_subject ON long_term_memories(subject_id);

            CREATE TABLE IF NOT EXISTS permission_nodes (
                node_name     TEXT PRIMARY KEY,
                plugin        TEXT NOT NULL,
                description   TEXT NOT NULL DEFAULT '',
                default_grant INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS user_permissions (
                platform   TEXT NOT NULL,
                user_id    TEXT NOT NULL,
                node_name  TEXT NOT NULL,
                granted_at TEXT NOT NULL,
                PRIMARY KEY (platform, user_id, node_name)
            );

            CREATE TABLE IF NOT EXISTS chat_streams (
                stream_key     TEXT PRIMARY KEY,
                platform       TEXT NOT NULL,
                last_active_ms INTEGER NOT NULL DEFAULT 0,
                message_count  INTEGER NOT NULL DEFAULT 0
            );
            ",
        )
        .map_err(|e| Error::Storage(format!("Failed to init schema: {}", e)))?;
        Ok(())
    }

    pub(crate) fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| Error::Storage(format!("Database lock poisoned: {}", e)))
    }
}
