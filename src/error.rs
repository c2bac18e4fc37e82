// Error taxonomy surfaced to callers through `TaskResult`.

use std::fmt;

/// Result of one task execution as seen by the caller.
pub type TaskResult<T> = Result<T, EngineError>;

/// Why a task took its skip path instead of issuing a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The task needs an authenticated session and the client has none.
    NoSession,
    /// The task targets an entity that is not bound to a remote id.
    Unbound,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoSession => f.write_str("no authenticated session"),
            SkipReason::Unbound => f.write_str("entity is not bound to a remote id"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid call arguments, detected before the task is submitted.
    #[error("invalid argument: {0}")]
    Config(String),

    #[error("request skipped: {0}")]
    Skipped(SkipReason),

    /// Network or I/O failure while executing or streaming a request.
    #[error("transport error: {0:#}")]
    Transport(anyhow::Error),

    /// A response arrived but could not be interpreted.
    #[error("protocol error: {0:#}")]
    Protocol(anyhow::Error),

    /// Cooperative cancellation was observed. Never delivered to a handler.
    #[error("task cancelled")]
    Cancelled,

    #[error("dispatcher is shut down")]
    Closed,
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Config(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Protocol(e.into())
    }
}
