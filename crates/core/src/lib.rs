pub mod config;
pub mod envelope;
pub mod error;
pub mod events;
pub mod paths;
pub mod stream;

pub use config::{Config, MemoryConfig, OverflowPolicy};
pub use envelope::{
    Direction, EnvelopeBatch, GroupInfo, MediaPayload, MessageEnvelope, MessageInfo, MessageKind,
    Segment, UserInfo, ENVELOPE_SCHEMA_VERSION,
};
pub use error::{Error, Result};
pub use paths::Paths;
pub use stream::{StreamKey, StreamScope};
