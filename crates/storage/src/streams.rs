use murmur_core::Result;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::graph::storage_err;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRow {
    pub stream_key: String,
    pub platform: String,
    pub last_active_ms: i64,
    pub message_count: i64,
}

/// Durable record of known chat streams; the in-memory windows are rebuilt
/// lazily, this only preserves identity and activity counters.
#[derive(Clone)]
pub struct StreamStore {
    db: Database,
}

impl StreamStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn touch(&self, stream_key: &str, platform: &str, last_active_ms: i64) -> Result<()> {
        self.db
            .lock()?
            .execute(
                "INSERT INTO chat_streams (stream_key, platform, last_active_ms, message_count)
                 VALUES (?1, ?2, ?3, 1)
                 ON CONFLICT(stream_key) DO UPDATE SET
                    last_active_ms = MAX(last_active_ms, excluded.last_active_ms),
                    message_count = message_count + 1",
                params![stream_key, platform, last_active_ms],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn get(&self, stream_key: &str) -> Result<Option<StreamRow>> {
        use rusqlite::OptionalExtension;
        self.db
            .lock()?
            .query_row(
                "SELECT stream_key, platform, last_active_ms, message_count
                 FROM chat_streams WHERE stream_key = ?1",
                params![stream_key],
                |row| {
                    Ok(StreamRow {
                        stream_key: row.get(0)?,
                        platform: row.get(1)?,
                        last_active_ms: row.get(2)?,
                        message_count: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(storage_err)
    }

    pub fn all(&self) -> Result<Vec<StreamRow>> {
        let guard = self.db.lock()?;
        let mut stmt = guard
            .prepare(
                "SELECT stream_key, platform, last_active_ms, message_count
                 FROM chat_streams ORDER BY last_active_ms DESC",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StreamRow {
                    stream_key: row.get(0)?,
                    platform: row.get(1)?,
                    last_active_ms: row.get(2)?,
                    message_count: row.get(3)?,
                })
            })
            .map_err(storage_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(storage_err)
    }
}
