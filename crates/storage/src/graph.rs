use chrono::{DateTime, Utc};
use murmur_core::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::db::Database;
use crate::entities::{EdgeType, LongTermKind, LongTermMemory, MemoryEdge, MemoryNode, NodeType};

/// Graph persistence over `memory_nodes`, `memory_edges` and
/// `long_term_memories`. Consolidation batches go through `with_transaction`
/// so a failing operation rolls the whole batch back.
#[derive(Clone)]
pub struct GraphStore {
    db: Database,
}

impl GraphStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Run a closure against one transaction: commit on Ok, roll back on Err.
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.db.lock()?;
        let tx = guard
            .transaction()
            .map_err(|e| Error::Storage(format!("Failed to begin transaction: {}", e)))?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()
                    .map_err(|e| Error::Storage(format!("Failed to commit: {}", e)))?;
                Ok(value)
            }
            Err(e) => {
                // Dropping the transaction rolls it back.
                debug!(error = %e, "Graph transaction rolled back");
                Err(e)
            }
        }
    }

    pub fn upsert_node(&self, node: &MemoryNode) -> Result<()> {
        sql::upsert_node(&*self.db.lock()?, node)
    }

    pub fn get_node(&self, id: &str) -> Result<Option<MemoryNode>> {
        sql::get_node(&*self.db.lock()?, id)
    }

    pub fn delete_node(&self, id: &str) -> Result<bool> {
        sql::delete_node(&*self.db.lock()?, id)
    }

    pub fn find_nodes_by_content(&self, content: &str, node_type: NodeType) -> Result<Vec<MemoryNode>> {
        let guard = self.db.lock()?;
        let mut stmt = guard
            .prepare("SELECT id, content, node_type, has_embedding, created_at FROM memory_nodes WHERE content = ?1 AND node_type = ?2")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![content, node_type.as_str()], sql::row_to_node)
            .map_err(storage_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(storage_err)
    }

    pub fn upsert_edge(&self, edge: &MemoryEdge) -> Result<()> {
        sql::upsert_edge(&*self.db.lock()?, edge)
    }

    pub fn get_edge(&self, id: &str) -> Result<Option<MemoryEdge>> {
        sql::get_edge(&*self.db.lock()?, id)
    }

    pub fn delete_edge(&self, id: &str) -> Result<bool> {
        sql::delete_edge(&*self.db.lock()?, id)
    }

    /// Every edge with the node at either end.
    pub fn edges_touching(&self, node_id: &str) -> Result<Vec<MemoryEdge>> {
        let guard = self.db.lock()?;
        let mut stmt = guard
            .prepare(
                "SELECT id, source_id, target_id, relation, edge_type, importance, metadata, created_at
                 FROM memory_edges WHERE source_id = ?1 OR target_id = ?1",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![node_id], sql::row_to_edge)
            .map_err(storage_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(storage_err)
    }

    pub fn insert_memory(&self, memory: &LongTermMemory) -> Result<()> {
        sql::upsert_memory(&*self.db.lock()?, memory)
    }

    pub fn get_memory(&self, id: &str) -> Result<Option<LongTermMemory>> {
        sql::get_memory(&*self.db.lock()?, id)
    }

    pub fn delete_memory(&self, id: &str) -> Result<bool> {
        sql::delete_memory(&*self.db.lock()?, id)
    }

    pub fn all_memories(&self) -> Result<Vec<LongTermMemory>> {
        let guard = self.db.lock()?;
        let mut stmt = guard
            .prepare(
                "SELECT id, subject_id, memory_type, node_ids, edge_ids, importance,
                        access_count, last_accessed, decay_factor, created_at
                 FROM long_term_memories",
            )
            .map_err(storage_err)?;
        let rows = stmt.query_map([], sql::row_to_memory).map_err(storage_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(storage_err)
    }

    pub fn memories_since(&self, since: DateTime<Utc>) -> Result<Vec<LongTermMemory>> {
        let guard = self.db.lock()?;
        let mut stmt = guard
            .prepare(
                "SELECT id, subject_id, memory_type, node_ids, edge_ids, importance,
                        access_count, last_accessed, decay_factor, created_at
                 FROM long_term_memories WHERE created_at >= ?1 ORDER BY created_at",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![since.to_rfc3339()], sql::row_to_memory)
            .map_err(storage_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(storage_err)
    }

    /// Memories whose member set includes the node. The id list is stored
    /// as a JSON array, so containment is a quoted-substring match.
    pub fn memories_with_node(&self, node_id: &str) -> Result<Vec<LongTermMemory>> {
        let guard = self.db.lock()?;
        let mut stmt = guard
            .prepare(
                "SELECT id, subject_id, memory_type, node_ids, edge_ids, importance,
                        access_count, last_accessed, decay_factor, created_at
                 FROM long_term_memories WHERE node_ids LIKE ?1",
            )
            .map_err(storage_err)?;
        let pattern = format!("%\"{}\"%", node_id);
        let rows = stmt
            .query_map(params![pattern], sql::row_to_memory)
            .map_err(storage_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(storage_err)
    }

    /// Access bump: refresh `last_accessed` and increment `access_count`.
    pub fn record_access(&self, id: &str) -> Result<()> {
        self.db
            .lock()?
            .execute(
                "UPDATE long_term_memories
                 SET access_count = access_count + 1, last_accessed = ?2
                 WHERE id = ?1",
                params![id, Utc::now().to_rfc3339()],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    /// Nightly decay pass: multiply every memory's decay factor.
    pub fn apply_decay(&self, factor: f32) -> Result<usize> {
        let changed = self
            .db
            .lock()?
            .execute(
                "UPDATE long_term_memories SET decay_factor = decay_factor * ?1",
                params![factor as f64],
            )
            .map_err(storage_err)?;
        Ok(changed)
    }

    pub fn counts(&self) -> Result<(usize, usize, usize)> {
        let guard = self.db.lock()?;
        let nodes: i64 = guard
            .query_row("SELECT COUNT(*) FROM memory_nodes", [], |r| r.get(0))
            .map_err(storage_err)?;
        let edges: i64 = guard
            .query_row("SELECT COUNT(*) FROM memory_edges", [], |r| r.get(0))
            .map_err(storage_err)?;
        let memories: i64 = guard
            .query_row("SELECT COUNT(*) FROM long_term_memories", [], |r| r.get(0))
            .map_err(storage_err)?;
        Ok((nodes as usize, edges as usize, memories as usize))
    }
}

pub(crate) fn storage_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

/// Row-level helpers shared by store methods and transaction closures.
/// Everything takes `&Connection`, so they work inside `with_transaction`.
pub mod sql {
    use super::*;

    pub fn upsert_node(conn: &Connection, node: &MemoryNode) -> Result<()> {
        conn.execute(
            "INSERT INTO memory_nodes (id, content, node_type, has_embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                node_type = excluded.node_type,
                has_embedding = excluded.has_embedding",
            params![
                node.id,
                node.content,
                node.node_type.as_str(),
                node.has_embedding as i64,
                node.created_at.to_rfc3339()
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    pub fn get_node(conn: &Connection, id: &str) -> Result<Option<MemoryNode>> {
        conn.query_row(
            "SELECT id, content, node_type, has_embedding, created_at FROM memory_nodes WHERE id = ?1",
            params![id],
            row_to_node,
        )
        .optional()
        .map_err(storage_err)
    }

    pub fn delete_node(conn: &Connection, id: &str) -> Result<bool> {
        let changed = conn
            .execute("DELETE FROM memory_nodes WHERE id = ?1", params![id])
            .map_err(storage_err)?;
        Ok(changed > 0)
    }

    pub fn upsert_edge(conn: &Connection, edge: &MemoryEdge) -> Result<()> {
        conn.execute(
            "INSERT INTO memory_edges
                (id, source_id, target_id, relation, edge_type, importance, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                source_id = excluded.source_id,
                target_id = excluded.target_id,
                relation = excluded.relation,
                edge_type = excluded.edge_type,
                importance = excluded.importance,
                metadata = excluded.metadata",
            params![
                edge.id,
                edge.source_id,
                edge.target_id,
                edge.relation,
                edge.edge_type.as_str(),
                edge.importance as f64,
                edge.metadata.to_string(),
                edge.created_at.to_rfc3339()
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    pub fn get_edge(conn: &Connection, id: &str) -> Result<Option<MemoryEdge>> {
        conn.query_row(
            "SELECT id, source_id, target_id, relation, edge_type, importance, metadata, created_at
             FROM memory_edges WHERE id = ?1",
            params![id],
            row_to_edge,
        )
        .optional()
        .map_err(storage_err)
    }

    pub fn delete_edge(conn: &Connection, id: &str) -> Result<bool> {
        let changed = conn
            .execute("DELETE FROM memory_edges WHERE id = ?1", params![id])
            .map_err(storage_err)?;
        Ok(changed > 0)
    }

    pub fn upsert_memory(conn: &Connection, memory: &LongTermMemory) -> Result<()> {
        conn.execute(
            "INSERT INTO long_term_memories
                (id, subject_id, memory_type, node_ids, edge_ids, importance,
                 access_count, last_accessed, decay_factor, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                subject_id = excluded.subject_id,
                memory_type = excluded.memory_type,
                node_ids = excluded.node_ids,
                edge_ids = excluded.edge_ids,
                importance = excluded.importance,
                access_count = excluded.access_count,
                last_accessed = excluded.last_accessed,
                decay_factor = excluded.decay_factor",
            params![
                memory.id,
                memory.subject_id,
                memory.memory_type.as_str(),
                serde_json::to_string(&memory.node_ids)?,
                serde_json::to_string(&memory.edge_ids)?,
                memory.importance as f64,
                memory.access_count,
                memory.last_accessed.to_rfc3339(),
                memory.decay_factor as f64,
                memory.created_at.to_rfc3339()
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    pub fn get_memory(conn: &Connection, id: &str) -> Result<Option<LongTermMemory>> {
        conn.query_row(
            "SELECT id, subject_id, memory_type, node_ids, edge_ids, importance,
                    access_count, last_accessed, decay_factor, created_at
             FROM long_term_memories WHERE id = ?1",
            params![id],
            row_to_memory,
        )
        .optional()
        .map_err(storage_err)
    }

    pub fn delete_memory(conn: &Connection, id: &str) -> Result<bool> {
        let changed = conn
            .execute("DELETE FROM long_term_memories WHERE id = ?1", params![id])
            .map_err(storage_err)?;
        Ok(changed > 0)
    }

    pub(crate) fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryNode> {
        let type_str: String = row.get(2)?;
        let created: String = row.get(4)?;
        Ok(MemoryNode {
            id: row.get(0)?,
            content: row.get(1)?,
            node_type: NodeType::from_str(&type_str).unwrap_or(NodeType::Value),
            has_embedding: row.get::<_, i64>(3)? != 0,
            created_at: parse_ts(&created),
        })
    }

    pub(crate) fn row_to_edge(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryEdge> {
        let type_str: String = row.get(4)?;
        let metadata: String = row.get(6)?;
        let created: String = row.get(7)?;
        Ok(MemoryEdge {
            id: row.get(0)?,
            source_id: row.get(1)?,
            target_id: row.get(2)?,
            relation: row.get(3)?,
            edge_type: EdgeType::from_str(&type_str).unwrap_or(EdgeType::Reference),
            importance: row.get::<_, f64>(5)? as f32,
            metadata: serde_json::from_str(&metadata).unwrap_or_else(|_| serde_json::json!({})),
            created_at: parse_ts(&created),
        })
    }

    pub(crate) fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<LongTermMemory> {
        let kind: String = row.get(2)?;
        let node_ids: String = row.get(3)?;
        let edge_ids: String = row.get(4)?;
        let last_accessed: String = row.get(7)?;
        let created: String = row.get(9)?;
        Ok(LongTermMemory {
            id: row.get(0)?,
            subject_id: row.get(1)?,
            memory_type: LongTermKind::from_str(&kind).unwrap_or(LongTermKind::Fact),
            node_ids: serde_json::from_str(&node_ids).unwrap_or_default(),
            edge_ids: serde_json::from_str(&edge_ids).unwrap_or_default(),
            importance: row.get::<_, f64>(5)? as f32,
            access_count: row.get(6)?,
            last_accessed: parse_ts(&last_accessed),
            decay_factor: row.get::<_, f64>(8)? as f32,
            created_at: parse_ts(&created),
        })
    }

    fn parse_ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> GraphStore {
        GraphStore::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn test_node_edge_memory_round_trip() {
        let graph = store();
        let subject = MemoryNode::new("I", NodeType::Subject);
        let topic = MemoryNode::new("sleep", NodeType::Topic);
        graph.upsert_node(&subject).unwrap();
        graph.upsert_node(&topic).unwrap();

        let edge = MemoryEdge::new(&subject.id, &topic.id, "does", EdgeType::MemoryType);
        graph.upsert_edge(&edge).unwrap();

        let mut memory = LongTermMemory::new(&subject.id, LongTermKind::Event);
        memory.node_ids = vec![subject.id.clone(), topic.id.clone()];
        memory.edge_ids = vec![edge.id.clone()];
        graph.insert_memory(&memory).unwrap();

        let loaded = graph.get_memory(&memory.id).unwrap().unwrap();
        assert_eq!(loaded.node_ids.len(), 2);
        assert_eq!(loaded.edge_ids, vec![edge.id.clone()]);
        assert_eq!(graph.edges_touching(&topic.id).unwrap().len(), 1);
        assert_eq!(graph.counts().unwrap(), (2, 1, 1));
    }

    #[test]
    fn test_transaction_rolls_back_whole_batch() {
        let graph = store();
        let node = MemoryNode::new("orphan", NodeType::Topic);
        let result: Result<()> = graph.with_transaction(|conn| {
            sql::upsert_node(conn, &node)?;
            Err(Error::Consolidation("bad op".to_string()))
        });
        assert!(result.is_err());
        assert!(graph.get_node(&node.id).unwrap().is_none());
    }

    #[test]
    fn test_access_and_decay() {
        let graph = store();
        let memory = LongTermMemory::new("s", LongTermKind::Fact);
        graph.insert_memory(&memory).unwrap();

        graph.record_access(&memory.id).unwrap();
        graph.record_access(&memory.id).unwrap();
        let loaded = graph.get_memory(&memory.id).unwrap().unwrap();
        assert_eq!(loaded.access_count, 2);

        graph.apply_decay(0.95).unwrap();
        let decayed = graph.get_memory(&memory.id).unwrap().unwrap();
        assert!((decayed.decay_factor - 0.95).abs() < 1e-6);
        assert!(decayed.effective_importance() < loaded.effective_importance());
    }

    #[test]
    fn test_applying_same_ops_twice_is_idempotent() {
        let graph = store();
        let node = MemoryNode::new("meet", NodeType::Topic);
        let edge = MemoryEdge::new("a", "b", "refers", EdgeType::Reference);

        for _ in 0..2 {
            graph
                .with_transaction(|conn| {
                    sql::upsert_node(conn, &node)?;
                    sql::upsert_edge(conn, &edge)?;
                    Ok(())
                })
                .unwrap();
        }
        let (nodes, edges, _) = graph.counts().unwrap();
        assert_eq!((nodes, edges), (1, 1));
    }
}
