pub mod engine;
pub mod long_term;
pub mod models;
pub mod ops;
pub mod perceptual;
pub mod retrieval;
pub mod short_term;

pub use engine::MemoryEngine;
pub use long_term::LongTermLayer;
pub use models::{
    BlockMessage, JudgeDecision, MemoryBlock, MemoryStats, MemoryTier, RetrievedMemory,
    ShortTermMemory,
};
pub use ops::{GraphOperation, MemoryDecision};
pub use perceptual::PerceptualLayer;
pub use retrieval::{is_causal_query, RetrievalWeights};
pub use short_term::ShortTermLayer;
