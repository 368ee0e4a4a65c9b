pub mod manager;
pub mod types;

pub use manager::{DirectListener, EventManager};
pub use types::{
    params_from, AggregatedResult, EventHandler, EventParams, EventSubscription, HandlerResult,
};
