use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Bad envelope: {0}")]
    BadEnvelope(String),

    #[error("Inbound buffer full: {0}")]
    BufferFull(String),

    /// Intentional short-circuit raised by a before-hook. Not a fault.
    #[error("Message skipped by pre-processing hook")]
    SkipMessage,

    #[error("Handler fault: {0}")]
    HandlerFault(String),

    #[error("No adapter registered for platform: {0}")]
    NoAdapterForPlatform(String),

    #[error("Adapter timed out: {0}")]
    AdapterTimeout(String),

    #[error("Transient adapter error: {0}")]
    TransientAdapter(String),

    #[error("Duplicate component: {0}")]
    DuplicateComponent(String),

    #[error("Plugin load failed: {0}")]
    PluginLoad(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Consolidation fault: {0}")]
    Consolidation(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Memory error: {0}")]
    Memory(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Transient errors are retried locally with backoff and never surfaced
    /// to users.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientAdapter(_) | Error::AdapterTimeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
