pub mod http;
pub mod manager;
pub mod ws;

pub use http::{ingest_batch, BatchItemResult, BatchResponse};
pub use manager::ChannelManager;
pub use ws::{WsAdapterServer, WsSink};
