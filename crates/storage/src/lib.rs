pub use rusqlite;

pub mod db;
pub mod entities;
pub mod graph;
pub mod journal;
pub mod permission;
pub mod streams;

pub use db::Database;
pub use entities::{EdgeType, LongTermKind, LongTermMemory, MemoryEdge, MemoryNode, NodeType};
pub use graph::GraphStore;
pub use journal::Journal;
pub use permission::{PermissionNode, PermissionStore};
pub use streams::{StreamRow, StreamStore};
