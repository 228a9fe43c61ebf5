//! Error types for Remora

use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum RemoraError {
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsafe protocol `{0}`, pass allow_unsafe_protocols to use it anyway")]
    UnsafeProtocol(String),

    #[error("unsafe option `{0}`, pass allow_unsafe_options to use it anyway")]
    UnsafeOption(String),

    #[error("git command failed (exit code {status}): {stderr}")]
    Command { status: i32, stderr: String },

    #[error("failed to parse git output: {0}")]
    Parse(String),

    #[error("Remote not found: {0}")]
    RemoteNotFound(String),
}

impl RemoraError {
    /// Exit code carried by a `Command` error, if this is one.
    pub fn status(&self) -> Option<i32> {
        match self {
            RemoraError::Command { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result type alias for Remora operations
pub type Result<T> = std::result::Result<T, RemoraError>;
