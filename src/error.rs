use thiserror::Error;

/// Errors raised by the process manager, log streamer and exception tracker.
///
/// Every variant is scoped to a single process or a single operation; nothing
/// here is fatal to the host application.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("process already registered: {0}")]
    AlreadyExists(String),

    #[error("process already running: {0}")]
    AlreadyRunning(String),

    #[error("process was not started with a pseudo-terminal: {0}")]
    NotPty(String),

    #[error("failed to launch {name}: {message}")]
    LaunchFailure { name: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("supervisor is shutting down")]
    ShuttingDown,
}

impl From<serde_json::Error> for SupervisorError {
    fn from(err: serde_json::Error) -> Self {
        SupervisorError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
