use std::fmt;

/// Failure taxonomy shared by capture, dispatch and monitoring.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Network failure or timeout talking to an engine.
    Transport(String),
    /// Engine answered with a non-200 status or an unusable body.
    Engine { status: u16, message: String },
    /// Event rejected before it reached the queue.
    Validation(String),
    /// Retry budget exhausted.
    Capacity { attempts: u32 },
    /// Durable store failure surfaced at the service boundary.
    Storage(String),
}

impl SyncError {
    /// Transport and engine failures count against an event's retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transport(_) | SyncError::Engine { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Transport(_) => "transport",
            SyncError::Engine { .. } => "engine",
            SyncError::Validation(_) => "validation",
            SyncError::Capacity { .. } => "capacity",
            SyncError::Storage(_) => "storage",
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Transport(msg) => write!(f, "transport error: {msg}"),
            SyncError::Engine { status, message } => {
                write!(f, "engine error (HTTP {status}): {message}")
            }
            SyncError::Validation(msg) => write!(f, "invalid event: {msg}"),
            SyncError::Capacity { attempts } => {
                write!(f, "retry cap reached after {attempts} attempts")
            }
            SyncError::Storage(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl std::error::Error for SyncError {}

pub type Result<T> = std::result::Result<T, SyncError>;
