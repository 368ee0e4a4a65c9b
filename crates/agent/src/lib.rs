pub mod context;
pub mod reply;
pub mod streams;

pub use context::AppContext;
pub use reply::ReplyGenerator;
pub use streams::{ChatStream, ChatStreamManager};
