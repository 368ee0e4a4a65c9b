use chrono::{Duration, Utc};
use murmur_core::{Error, MemoryConfig, Result};
use murmur_providers::{EmbeddingProvider, LanguageModel, LlmRequest, VectorStore};
use murmur_storage::{
    graph::sql, EdgeType, GraphStore, LongTermMemory, MemoryEdge, MemoryNode, NodeType,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::models::{ShortTermMemory, NODE_COLLECTION};
use crate::ops::{parse_causality, parse_operations, GraphOperation};

/// Above this similarity a new topic/object node merges into an existing one
/// when their adjacent relation labels are compatible.
const DEDUP_MERGE_THRESHOLD: f32 = 0.85;
/// Above this it merges unconditionally.
const DEDUP_FORCE_THRESHOLD: f32 = 0.95;
/// Relation-discovery caps per pass.
const DISCOVERY_PAIR_CAP: usize = 20;
const TEMPORAL_WINDOW_MS: i64 = 3_600_000;
const REFERENCE_IMPORTANCE: f32 = 0.4;

const CONSOLIDATION_PROMPT: &str = "You maintain a memory graph. Fold the incoming memories into \
the graph using operations.\nReturn a JSON array of operations; each is one of:\n\
{\"op\":\"create_memory\",\"memory_type\":\"event|fact|relation|opinion\",\"subject\":...,\"topic\":...,\"object\":...,\"importance\":0.0-1.0,\"attributes\":{...}}\n\
{\"op\":\"update_memory\",\"id\":...,\"importance\":...}\n\
{\"op\":\"merge_memories\",\"keep_id\":...,\"merge_id\":...}\n\
{\"op\":\"create_node\"|\"update_node\"|\"delete_node\", ...}\n\
{\"op\":\"create_edge\",\"source_id\":...,\"target_id\":...,\"relation\":...,\"edge_type\":\"memory_type|core_relation|attribute|causality|reference\"}\n\
{\"op\":\"update_edge\"|\"delete_edge\",\"id\":...}\n\
{\"op\":\"create_subgraph\",\"nodes\":[...],\"edges\":[...]}\n\
{\"op\":\"query_graph\",\"node_content\":...}\n\n";

const CAUSALITY_PROMPT: &str = "Do these two memories form a cause-effect pair?\n\
Reply with JSON: {\"causal\": true|false, \"importance\": 0.0-1.0}.\n\n";

/// How a planned node reference resolves: an existing row or a fresh insert.
enum NodeRef {
    Existing(String),
    New(MemoryNode),
}

impl NodeRef {
    fn id(&self) -> &str {
        match self {
            NodeRef::Existing(id) => id,
            NodeRef::New(node) => &node.id,
        }
    }
}

/// The graph tier: LLM-driven consolidation, deduplicated node inserts,
/// slow decay, and background relation discovery.
pub struct LongTermLayer {
    graph: GraphStore,
    embedder: Arc<dyn EmbeddingProvider>,
    vectors: Arc<dyn VectorStore>,
    llm: Arc<dyn LanguageModel>,
    model_name: String,
    decay_factor: f32,
}

impl LongTermLayer {
    pub fn new(
        cfg: &MemoryConfig,
        model_name: &str,
        graph: GraphStore,
        embedder: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorStore>,
        llm: Arc<dyn LanguageModel>,
    ) -> Self {
        Self {
            graph,
            embedder,
            vectors,
            llm,
            model_name: model_name.to_string(),
            decay_factor: cfg.long_term_decay_factor,
        }
    }

    pub fn graph(&self) -> &GraphStore {
        &self.graph
    }

    /// Consolidate one batch of promoted short-term memories. The model
    /// proposes operations; they apply atomically — any failure rolls the
    /// whole batch back and surfaces `Consolidation` for the retry path.
    pub async fn consolidate(&self, batch: &[ShortTermMemory]) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let mut prompt = String::from(CONSOLIDATION_PROMPT);
        prompt.push_str("Incoming memories:\n");
        for memory in batch {
            prompt.push_str(&format!("- {}\n", memory.content_text()));
        }
        let neighbourhood = self.describe_neighbourhood(batch).await?;
        if !neighbourhood.is_empty() {
            prompt.push_str("\nRelevant existing graph:\n");
            prompt.push_str(&neighbourhood);
        }

        let request = LlmRequest::new(&self.model_name, &prompt).with_temperature(0.2);
        let raw = self
            .llm
            .complete(&request)
            .await
            .map_err(|e| Error::Consolidation(format!("consolidation model call failed: {}", e)))?;
        let operations = parse_operations(&raw)?;

        self.apply_operations(operations).await
    }

    /// Resolve embeddings/dedup up front, then apply every operation in one
    /// transaction. New embeddable nodes index after commit.
    pub async fn apply_operations(&self, operations: Vec<GraphOperation>) -> Result<usize> {
        let mut planned_nodes: Vec<MemoryNode> = Vec::new();
        let mut planned_edges: Vec<MemoryEdge> = Vec::new();
        let mut planned_memories: Vec<LongTermMemory> = Vec::new();
        let mut updates: Vec<GraphOperation> = Vec::new();
        let applied = operations.len();

        for op in operations {
            match op {
                GraphOperation::CreateMemory {
                    memory_type,
                    subject,
                    topic,
                    object,
                    importance,
                    attributes,
                } => {
                    let subject_ref = self.resolve_exact(&subject, NodeType::Subject)?;
                    let topic_relations = vec![memory_type.as_str().to_string(), "core".to_string()];
                    let topic_ref = self
                        .resolve_embeddable(&topic, NodeType::Topic, &topic_relations)
                        .await?;
                    let object_ref = self
                        .resolve_embeddable(&object, NodeType::Object, &["core".to_string()])
                        .await?;

                    let mut node_ids = vec![
                        subject_ref.id().to_string(),
                        topic_ref.id().to_string(),
                        object_ref.id().to_string(),
                    ];
                    let mut edge_ids = Vec::new();

                    let type_edge = MemoryEdge::new(
                        subject_ref.id(),
                        topic_ref.id(),
                        memory_type.as_str(),
                        EdgeType::MemoryType,
                    )
                    .with_importance(importance);
                    let core_edge = MemoryEdge::new(
                        topic_ref.id(),
                        object_ref.id(),
                        "core",
                        EdgeType::CoreRelation,
                    )
                    .with_importance(importance);
                    edge_ids.push(type_edge.id.clone());
                    edge_ids.push(core_edge.id.clone());

                    let mut memory = LongTermMemory::new(subject_ref.id(), memory_type);
                    for (key, value) in &attributes {
                        let attr_node = MemoryNode::new(key, NodeType::Attribute);
                        let value_text = value
                            .as_str()
                            .map(String::from)
                            .unwrap_or_else(|| value.to_string());
                        let value_node = MemoryNode::new(&value_text, NodeType::Value);
                        let attr_edge =
                            MemoryEdge::new(topic_ref.id(), &attr_node.id, key, EdgeType::Attribute);
                        let value_edge =
                            MemoryEdge::new(&attr_node.id, &value_node.id, "value", EdgeType::Attribute);
                        node_ids.push(attr_node.id.clone());
                        node_ids.push(value_node.id.clone());
                        edge_ids.push(attr_edge.id.clone());
                        edge_ids.push(value_edge.id.clone());
                        planned_nodes.push(attr_node);
                        planned_nodes.push(value_node);
                        planned_edges.push(attr_edge);
                        planned_edges.push(value_edge);
                    }

                    for node_ref in [subject_ref, topic_ref, object_ref] {
                        if let NodeRef::New(node) = node_ref {
                            planned_nodes.push(node);
                        }
                    }
                    planned_edges.push(type_edge);
                    planned_edges.push(core_edge);
                    memory.node_ids = node_ids;
                    memory.edge_ids = edge_ids;
                    memory.importance = importance.clamp(0.0, 1.0);
                    planned_memories.push(memory);
                }
                GraphOperation::CreateNode { content, node_type } => {
                    let node_ref = if node_type.is_embeddable() {
                        self.resolve_embeddable(&content, node_type, &[]).await?
                    } else {
                        self.resolve_exact(&content, node_type)?
                    };
                    if let NodeRef::New(node) = node_ref {
                        planned_nodes.push(node);
                    }
                }
                GraphOperation::CreateEdge {
                    source_id,
                    target_id,
                    relation,
                    edge_type,
                    importance,
                } => {
                    let edge = MemoryEdge::new(&source_id, &target_id, &relation, edge_type)
                        .with_importance(importance.unwrap_or(0.5));
                    planned_edges.push(edge);
                }
                GraphOperation::CreateSubgraph { nodes, edges } => {
                    let mut temp_map: HashMap<String, String> = HashMap::new();
                    for spec in nodes {
                        let node_ref = if spec.node_type.is_embeddable() {
                            self.resolve_embeddable(&spec.content, spec.node_type, &[]).await?
                        } else {
                            self.resolve_exact(&spec.content, spec.node_type)?
                        };
                        temp_map.insert(spec.temp_id.clone(), node_ref.id().to_string());
                        if let NodeRef::New(node) = node_ref {
                            planned_nodes.push(node);
                        }
                    }
                    for spec in edges {
                        let source = temp_map.get(&spec.source).cloned().unwrap_or(spec.source);
                        let target = temp_map.get(&spec.target).cloned().unwrap_or(spec.target);
                        planned_edges.push(MemoryEdge::new(
                            &source,
                            &target,
                            &spec.relation,
                            spec.edge_type,
                        ));
                    }
                }
                GraphOperation::QueryGraph { node_content } => {
                    let found = self.graph.find_nodes_by_content(&node_content, NodeType::Topic)?;
                    debug!(content = %node_content, matches = found.len(), "query_graph");
                }
                other => updates.push(other),
            }
        }

        let graph = &self.graph;
        graph.with_transaction(|conn| {
            for node in &planned_nodes {
                sql::upsert_node(conn, node)?;
            }
            for edge in &planned_edges {
                // Edges must reference rows that exist after this batch.
                let source_ok = sql::get_node(conn, &edge.source_id)?.is_some()
                    || sql::get_memory(conn, &edge.source_id)?.is_some();
                let target_ok = sql::get_node(conn, &edge.target_id)?.is_some()
                    || sql::get_memory(conn, &edge.target_id)?.is_some();
                if !source_ok || !target_ok {
                    return Err(Error::Consolidation(format!(
                        "edge {} references missing endpoint",
                        edge.id
                    )));
                }
                sql::upsert_edge(conn, edge)?;
            }
            for memory in &planned_memories {
                sql::upsert_memory(conn, memory)?;
            }
            for op in &updates {
                apply_update(conn, op)?;
            }
            Ok(())
        })?;

        // Index new topic/object nodes; failures leave them for reindex.
        for node in planned_nodes.iter().filter(|n| n.node_type.is_embeddable()) {
            if let Err(e) = self.index_node(node).await {
                warn!(node = %node.id, error = %e, "Node indexing failed, leaving for reindex");
            }
        }

        info!(operations = applied, "Consolidation batch applied");
        Ok(applied)
    }

    /// Exact-content dedup for non-embeddable node kinds.
    fn resolve_exact(&self, content: &str, node_type: NodeType) -> Result<NodeRef> {
        let existing = self.graph.find_nodes_by_content(content, node_type)?;
        match existing.into_iter().next() {
            Some(node) => Ok(NodeRef::Existing(node.id)),
            None => Ok(NodeRef::New(MemoryNode::new(content, node_type))),
        }
    }

    /// Vector dedup for topic/object nodes: merge unconditionally above the
    /// force threshold, merge above the base threshold only when the
    /// higher-order context (adjacent relation labels) is compatible.
    async fn resolve_embeddable(
        &self,
        content: &str,
        node_type: NodeType,
        proposed_relations: &[String],
    ) -> Result<NodeRef> {
        let embedding = match self.embedder.embed(content).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(content, error = %e, "Node embedding failed, skipping dedup");
                return Ok(NodeRef::New(MemoryNode::new(content, node_type)));
            }
        };
        let hits = self
            .vectors
            .search(NODE_COLLECTION, &embedding, 3, DEDUP_MERGE_THRESHOLD)
            .await?;

        for hit in hits {
            let Some(node) = self.graph.get_node(&hit.id)? else {
                continue;
            };
            if node.node_type != node_type {
                continue;
            }
            if hit.score >= DEDUP_FORCE_THRESHOLD {
                debug!(content, existing = %node.id, score = hit.score, "Node dedup (unconditional)");
                return Ok(NodeRef::Existing(node.id));
            }
            let adjacent: HashSet<String> = self
                .graph
                .edges_touching(&node.id)?
                .into_iter()
                .map(|e| e.relation)
                .collect();
            let compatible = adjacent.is_empty()
                || proposed_relations.is_empty()
                || proposed_relations.iter().any(|r| adjacent.contains(r));
            if compatible {
                debug!(content, existing = %node.id, score = hit.score, "Node dedup (context match)");
                return Ok(NodeRef::Existing(node.id));
            }
        }
        Ok(NodeRef::New(MemoryNode::new(content, node_type)))
    }

    async fn index_node(&self, node: &MemoryNode) -> Result<()> {
        let embedding = self.embedder.embed(&node.content).await?;
        self.vectors.upsert(NODE_COLLECTION, &node.id, &embedding).await?;
        let mut updated = node.clone();
        updated.has_embedding = true;
        self.graph.upsert_node(&updated)
    }

    /// Retry embeddings for graph nodes that missed theirs.
    pub async fn reindex(&self) -> Result<usize> {
        // Memories reference their nodes; sweep all nodes via the edge list
        // is overkill — query nodes lacking embeddings directly.
        let mut fixed = 0;
        for memory in self.graph.all_memories()? {
            for node_id in &memory.node_ids {
                if let Some(node) = self.graph.get_node(node_id)? {
                    if node.node_type.is_embeddable() && !node.has_embedding {
                        if self.index_node(&node).await.is_ok() {
                            fixed += 1;
                        }
                    }
                }
            }
        }
        Ok(fixed)
    }

    fn describe_memory(&self, memory: &LongTermMemory) -> Result<String> {
        let mut parts = Vec::new();
        for node_id in &memory.node_ids {
            if let Some(node) = self.graph.get_node(node_id)? {
                if !matches!(node.node_type, NodeType::Attribute) {
                    parts.push(node.content);
                }
            }
        }
        Ok(parts.join(" "))
    }

    async fn describe_neighbourhood(&self, batch: &[ShortTermMemory]) -> Result<String> {
        let mut lines = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for memory in batch {
            for text in [&memory.topic, &memory.object] {
                let Ok(embedding) = self.embedder.embed(text).await else {
                    continue;
                };
                let hits = self.vectors.search(NODE_COLLECTION, &embedding, 3, 0.5).await?;
                for hit in hits {
                    if !seen.insert(hit.id.clone()) {
                        continue;
                    }
                    if let Some(node) = self.graph.get_node(&hit.id)? {
                        let relations: Vec<String> = self
                            .graph
                            .edges_touching(&node.id)?
                            .into_iter()
                            .map(|e| format!("{}:{}", e.relation, e.edge_type.as_str()))
                            .collect();
                        lines.push(format!(
                            "- node {} [{}] ({}) relations: {}",
                            node.id,
                            node.node_type.as_str(),
                            node.content,
                            relations.join(", ")
                        ));
                    }
                }
            }
        }
        Ok(lines.join("\n"))
    }

    /// Nightly slow decay over the whole tier.
    pub fn nightly_decay(&self) -> Result<usize> {
        let changed = self.graph.apply_decay(self.decay_factor)?;
        info!(memories = changed, "Long-term decay applied");
        Ok(changed)
    }

    pub async fn record_access(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            self.graph.record_access(id)?;
        }
        Ok(())
    }

    /// Periodic relation discovery over recently consolidated memories:
    /// temporal neighbours judged for causality, shared-node clusters wired
    /// with REFERENCE edges. Discovered edges are marked and weighted below
    /// user-observed ones.
    pub async fn discover_relations(&self, lookback: Duration) -> Result<usize> {
        let recent = self.graph.memories_since(Utc::now() - lookback)?;
        if recent.len() < 2 {
            return Ok(0);
        }
        let mut added = 0;

        let mut pairs_checked = 0;
        'outer: for i in 0..recent.len() {
            for j in (i + 1)..recent.len() {
                if pairs_checked >= DISCOVERY_PAIR_CAP {
                    break 'outer;
                }
                let a = &recent[i];
                let b = &recent[j];
                let gap = (a.created_at - b.created_at).num_milliseconds().abs();
                if gap > TEMPORAL_WINDOW_MS {
                    continue;
                }
                if self.memories_linked(&a.id, &b.id)? {
                    continue;
                }
                pairs_checked += 1;

                let prompt = format!(
                    "{}A: {}\nB: {}\n",
                    CAUSALITY_PROMPT,
                    self.describe_memory(a)?,
                    self.describe_memory(b)?
                );
                let request = LlmRequest::new(&self.model_name, &prompt).with_temperature(0.1);
                let verdict = match self.llm.complete(&request).await {
                    Ok(raw) => parse_causality(&raw),
                    Err(e) => {
                        warn!(error = %e, "Causality judge failed, NO_OP for pair");
                        None
                    }
                };
                if let Some(verdict) = verdict {
                    if verdict.causal {
                        let edge = MemoryEdge::new(&a.id, &b.id, "causes", EdgeType::Causality)
                            .with_importance(verdict.importance.min(0.5))
                            .mark_discovered();
                        self.graph.upsert_edge(&edge)?;
                        added += 1;
                    }
                }
            }
        }

        // Shared-node clusters get reference links.
        let mut by_node: HashMap<&str, Vec<&LongTermMemory>> = HashMap::new();
        for memory in &recent {
            for node_id in &memory.node_ids {
                by_node.entry(node_id.as_str()).or_default().push(memory);
            }
        }
        for (_, cluster) in by_node.into_iter().filter(|(_, c)| c.len() >= 2) {
            for window in cluster.windows(2) {
                let (a, b) = (window[0], window[1]);
                if self.memories_linked(&a.id, &b.id)? {
                    continue;
                }
                let edge = MemoryEdge::new(&a.id, &b.id, "refers", EdgeType::Reference)
                    .with_importance(REFERENCE_IMPORTANCE)
                    .mark_discovered();
                self.graph.upsert_edge(&edge)?;
                added += 1;
            }
        }

        if added > 0 {
            info!(edges = added, "Relation discovery added edges");
        }
        Ok(added)
    }

    fn memories_linked(&self, a: &str, b: &str) -> Result<bool> {
        Ok(self
            .graph
            .edges_touching(a)?
            .iter()
            .any(|e| e.source_id == b || e.target_id == b))
    }

    /// Graph expansion for retrieval: entry nodes → memories containing
    /// them (distance 1), then memory-to-memory edges (distance 2). Causal
    /// queries follow only CAUSALITY edges at the second hop.
    pub fn expand(
        &self,
        entry_node_ids: &[String],
        depth: u32,
        causal: bool,
    ) -> Result<Vec<(LongTermMemory, u32)>> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut results: Vec<(LongTermMemory, u32)> = Vec::new();

        let mut frontier: Vec<LongTermMemory> = Vec::new();
        for node_id in entry_node_ids {
            for memory in self.graph.memories_with_node(node_id)? {
                if seen.insert(memory.id.clone()) {
                    frontier.push(memory.clone());
                    results.push((memory, 1));
                }
            }
        }

        let mut current_depth = 1;
        while current_depth < depth {
            let mut next_frontier = Vec::new();
            for memory in &frontier {
                for edge in self.graph.edges_touching(&memory.id)? {
                    if causal && edge.edge_type != EdgeType::Causality {
                        continue;
                    }
                    let other_id = if edge.source_id == memory.id {
                        &edge.target_id
                    } else {
                        &edge.source_id
                    };
                    if let Some(other) = self.graph.get_memory(other_id)? {
                        if seen.insert(other.id.clone()) {
                            next_frontier.push(other.clone());
                            results.push((other, current_depth + 1));
                        }
                    }
                }
            }
            frontier = next_frontier;
            current_depth += 1;
        }
        Ok(results)
    }

    /// Entry nodes for a query embedding.
    pub async fn entry_nodes(&self, query_embedding: &[f32], top_k: usize) -> Result<Vec<String>> {
        let hits = self
            .vectors
            .search(NODE_COLLECTION, query_embedding, top_k, 0.5)
            .await?;
        Ok(hits.into_iter().map(|h| h.id).collect())
    }

    pub fn describe(&self, memory: &LongTermMemory) -> String {
        self.describe_memory(memory).unwrap_or_default()
    }
}

/// Update-flavoured operations applied directly inside the transaction.
fn apply_update(conn: &murmur_storage::rusqlite::Connection, op: &GraphOperation) -> Result<()> {
    match op {
        GraphOperation::UpdateMemory {
            id,
            importance,
            memory_type,
        } => {
            let mut memory = sql::get_memory(conn, id)?
                .ok_or_else(|| Error::Consolidation(format!("update_memory: {} missing", id)))?;
            if let Some(importance) = importance {
                memory.importance = importance.clamp(0.0, 1.0);
            }
            if let Some(kind) = memory_type {
                memory.memory_type = *kind;
            }
            sql::upsert_memory(conn, &memory)
        }
        GraphOperation::MergeMemories { keep_id, merge_id } => {
            let mut keep = sql::get_memory(conn, keep_id)?
                .ok_or_else(|| Error::Consolidation(format!("merge: {} missing", keep_id)))?;
            let merged = sql::get_memory(conn, merge_id)?
                .ok_or_else(|| Error::Consolidation(format!("merge: {} missing", merge_id)))?;
            for node_id in merged.node_ids {
                if !keep.node_ids.contains(&node_id) {
                    keep.node_ids.push(node_id);
                }
            }
            for edge_id in merged.edge_ids {
                if !keep.edge_ids.contains(&edge_id) {
                    keep.edge_ids.push(edge_id);
                }
            }
            keep.importance = keep.importance.max(merged.importance);
            keep.access_count += merged.access_count;
            sql::upsert_memory(conn, &keep)?;
            sql::delete_memory(conn, merge_id)?;
            Ok(())
        }
        GraphOperation::UpdateNode { id, content } => {
            let mut node = sql::get_node(conn, id)?
                .ok_or_else(|| Error::Consolidation(format!("update_node: {} missing", id)))?;
            node.content = content.clone();
            node.has_embedding = false;
            sql::upsert_node(conn, &node)
        }
        GraphOperation::DeleteNode { id } => {
            sql::delete_node(conn, id)?;
            Ok(())
        }
        GraphOperation::UpdateEdge {
            id,
            relation,
            importance,
        } => {
            let mut edge = sql::get_edge(conn, id)?
                .ok_or_else(|| Error::Consolidation(format!("update_edge: {} missing", id)))?;
            if let Some(relation) = relation {
                edge.relation = relation.clone();
            }
            if let Some(importance) = importance {
                edge.importance = importance.clamp(0.0, 1.0);
            }
            sql::upsert_edge(conn, &edge)
        }
        GraphOperation::DeleteEdge { id } => {
            sql::delete_edge(conn, id)?;
            Ok(())
        }
        _ => Ok(()),
    }
}
