//! ORM-level shapes of the persisted graph entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Subject,
    Topic,
    Object,
    Attribute,
    Value,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Subject => "subject",
            NodeType::Topic => "topic",
            NodeType::Object => "object",
            NodeType::Attribute => "attribute",
            NodeType::Value => "value",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "subject" => Some(NodeType::Subject),
            "topic" => Some(NodeType::Topic),
            "object" => Some(NodeType::Object),
            "attribute" => Some(NodeType::Attribute),
            "value" => Some(NodeType::Value),
            _ => None,
        }
    }

    /// Only topic and object nodes carry embeddings in the vector index.
    pub fn is_embeddable(&self) -> bool {
        matches!(self, NodeType::Topic | NodeType::Object)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    MemoryType,
    CoreRelation,
    Attribute,
    Causality,
    Reference,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::MemoryType => "memory_type",
            EdgeType::CoreRelation => "core_relation",
            EdgeType::Attribute => "attribute",
            EdgeType::Causality => "causality",
            EdgeType::Reference => "reference",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "memory_type" => Some(EdgeType::MemoryType),
            "core_relation" => Some(EdgeType::CoreRelation),
            "attribute" => Some(EdgeType::Attribute),
            "causality" => Some(EdgeType::Causality),
            "reference" => Some(EdgeType::Reference),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LongTermKind {
    Event,
    Fact,
    Relation,
    Opinion,
}

impl LongTermKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LongTermKind::Event => "event",
            LongTermKind::Fact => "fact",
            LongTermKind::Relation => "relation",
            LongTermKind::Opinion => "opinion",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "event" => Some(LongTermKind::Event),
            "fact" => Some(LongTermKind::Fact),
            "relation" => Some(LongTermKind::Relation),
            "opinion" => Some(LongTermKind::Opinion),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryNode {
    pub id: String,
    pub content: String,
    pub node_type: NodeType,
    pub has_embedding: bool,
    pub created_at: DateTime<Utc>,
}

impl MemoryNode {
    pub fn new(content: &str, node_type: NodeType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.to_string(),
            node_type,
            has_embedding: false,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEdge {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub relation: String,
    pub edge_type: EdgeType,
    pub importance: f32,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl MemoryEdge {
    pub fn new(source_id: &str, target_id: &str, relation: &str, edge_type: EdgeType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            relation: relation.to_string(),
            edge_type,
            importance: 0.5,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance.clamp(0.0, 1.0);
        self
    }

    /// Edges found by the relation-discovery job rather than observed in
    /// conversation.
    pub fn mark_discovered(mut self) -> Self {
        self.metadata["discovered"] = serde_json::json!(true);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongTermMemory {
    pub id: String,
    pub subject_id: String,
    pub memory_type: LongTermKind,
    pub node_ids: Vec<String>,
    pub edge_ids: Vec<String>,
    pub importance: f32,
    pub access_count: i64,
    pub last_accessed: DateTime<Utc>,
    pub decay_factor: f32,
    pub created_at: DateTime<Utc>,
}

impl LongTermMemory {
    pub fn new(subject_id: &str, memory_type: LongTermKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            subject_id: subject_id.to_string(),
            memory_type,
            node_ids: vec![subject_id.to_string()],
            edge_ids: Vec::new(),
            importance: 0.5,
            access_count: 0,
            last_accessed: Utc::now(),
            decay_factor: 1.0,
            created_at: Utc::now(),
        }
    }

    /// Ranking weight combining importance with accumulated decay.
    pub fn effective_importance(&self) -> f32 {
        self.importance * self.decay_factor
    }
}
