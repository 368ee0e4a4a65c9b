//! Typed operations the language models emit as JSON. Parsing is tolerant:
//! invalid entries are rejected and logged, never executed.

use murmur_storage::{EdgeType, LongTermKind, NodeType};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::models::JudgeDecision;

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("code fence regex is valid")
});

/// Strip a markdown code fence if the model wrapped its JSON in one.
pub fn strip_fences(raw: &str) -> &str {
    CODE_FENCE
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(raw)
        .trim()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubgraphNode {
    pub temp_id: String,
    pub content: String,
    pub node_type: NodeType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubgraphEdge {
    /// A `temp_id` from this subgraph or an existing node id.
    pub source: String,
    pub target: String,
    pub relation: String,
    pub edge_type: EdgeType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GraphOperation {
    CreateMemory {
        memory_type: LongTermKind,
        subject: String,
        topic: String,
        object: String,
        #[serde(default = "default_importance")]
        importance: f32,
        #[serde(default)]
        attributes: Map<String, Value>,
    },
    UpdateMemory {
        id: String,
        #[serde(default)]
        importance: Option<f32>,
        #[serde(default)]
        memory_type: Option<LongTermKind>,
    },
    MergeMemories {
        keep_id: String,
        merge_id: String,
    },
    CreateNode {
        content: String,
        node_type: NodeType,
    },
    UpdateNode {
        id: String,
        content: String,
    },
    DeleteNode {
        id: String,
    },
    CreateEdge {
        source_id: String,
        target_id: String,
        relation: String,
        edge_type: EdgeType,
        #[serde(default)]
        importance: Option<f32>,
    },
    UpdateEdge {
        id: String,
        #[serde(default)]
        relation: Option<String>,
        #[serde(default)]
        importance: Option<f32>,
    },
    DeleteEdge {
        id: String,
    },
    CreateSubgraph {
        nodes: Vec<SubgraphNode>,
        edges: Vec<SubgraphEdge>,
    },
    QueryGraph {
        node_content: String,
    },
}

fn default_importance() -> f32 {
    0.5
}

/// Parse a model response into operations. Elements that fail to parse are
/// skipped with a warning; a response that is not a JSON array parses to an
/// error.
pub fn parse_operations(raw: &str) -> murmur_core::Result<Vec<GraphOperation>> {
    let cleaned = strip_fences(raw);
    let items: Vec<Value> = serde_json::from_str(cleaned).map_err(|e| {
        murmur_core::Error::Consolidation(format!("operations are not a JSON array: {}", e))
    })?;
    let mut ops = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<GraphOperation>(item.clone()) {
            Ok(op) => ops.push(op),
            Err(e) => {
                warn!(error = %e, op = %item, "Rejecting invalid graph operation");
            }
        }
    }
    Ok(ops)
}

/// A triple extracted from a promoted perceptual block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedTriple {
    pub subject: String,
    pub topic: String,
    pub object: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub importance: Option<f32>,
}

/// Tolerant parse of the extraction response: a JSON array of triples.
/// Anything unparseable yields an empty list (NO_OP).
pub fn parse_triples(raw: &str) -> Vec<ExtractedTriple> {
    let cleaned = strip_fences(raw);
    match serde_json::from_str::<Vec<Value>>(cleaned) {
        Ok(items) => items
            .into_iter()
            .filter_map(|item| match serde_json::from_value(item.clone()) {
                Ok(triple) => Some(triple),
                Err(e) => {
                    warn!(error = %e, item = %item, "Rejecting invalid triple");
                    None
                }
            })
            .collect(),
        Err(e) => {
            warn!(error = %e, "Triple extraction response unparseable, treating as NO_OP");
            Vec::new()
        }
    }
}

/// The decision the model takes for one candidate against its neighbours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum MemoryDecision {
    Merge { target_id: String },
    Update { target_id: String },
    CreateNew,
    Discard,
}

/// `None` means NO_OP: the candidate is left alone and the failure logged.
pub fn parse_decision(raw: &str) -> Option<MemoryDecision> {
    let cleaned = strip_fences(raw);
    match serde_json::from_str(cleaned) {
        Ok(decision) => Some(decision),
        Err(e) => {
            warn!(error = %e, "Memory decision unparseable, treating as NO_OP");
            None
        }
    }
}

/// Judge verdict; parse failures default to insufficient so retrieval
/// expands into the graph.
pub fn parse_judge(raw: &str) -> JudgeDecision {
    let cleaned = strip_fences(raw);
    match serde_json::from_str::<JudgeDecision>(cleaned) {
        Ok(decision) => decision,
        Err(e) => {
            warn!(error = %e, "Judge response unparseable, defaulting to insufficient");
            JudgeDecision::insufficient("judge response unparseable")
        }
    }
}

/// Causality verdict for relation discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CausalityVerdict {
    pub causal: bool,
    #[serde(default = "default_importance")]
    pub importance: f32,
}

pub fn parse_causality(raw: &str) -> Option<CausalityVerdict> {
    serde_json::from_str(strip_fences(raw)).ok()
}
