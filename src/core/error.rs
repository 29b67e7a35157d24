use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Provider has been shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, TopologyError>;

impl TopologyError {
    /// Returns true for connection-level failures that drive channel recovery.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl<T> From<std::sync::PoisonError<T>> for TopologyError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for TopologyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for TopologyError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TopologyError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::Transport(format!("timed out: {}", err))
    }
}
