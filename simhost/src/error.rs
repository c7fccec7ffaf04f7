use simdb::SimDbError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("Policy violation for module {module}: {reason}")]
    PolicyViolation { module: String, reason: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Circuit open for module {0}")]
    CircuitOpen(String),

    #[error("Module {module} exceeded its {budget_ms} ms runtime budget")]
    Timeout { module: String, budget_ms: u64 },

    #[error("Unknown module: {0}")]
    UnknownModule(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Worker channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Db(#[from] SimDbError),
}

pub type Result<T> = std::result::Result<T, HostError>;
