//! Well-known event names and permission groups shared across subsystems.

/// Fired for every routed chat message after ingestion.
pub const NORMAL_MESSAGE: &str = "normal_message";

/// Fired when an adapter connects or reconnects for a platform.
pub const ADAPTER_CONNECTED: &str = "adapter_connected";

/// Fired by proactive flows to cold-start a conversation on a stream.
pub const PROACTIVE_INITIATION: &str = "ProactiveInitiationEvent";

/// Fired by the memory engine when a short-term memory is promoted.
pub const MEMORY_PROMOTED: &str = "memory_promoted";

/// Permission group used by core subsystems; matches every handler group.
pub const SYSTEM_GROUP: &str = "SYSTEM";
