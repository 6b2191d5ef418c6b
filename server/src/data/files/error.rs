//! File service error types

use thiserror::Error;

use crate::domain::gateway::GatewayError;

#[derive(Debug, Error)]
pub enum FileError {
    /// File storage is disabled by configuration
    #[error("file storage is disabled")]
    Disabled,

    /// Zero-byte upload
    #[error("file is empty")]
    Empty,

    /// Upload exceeds the configured cap
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },

    /// No such file record or stored object
    #[error("file not found: {0}")]
    NotFound(String),

    /// File exists but has not completed processing
    #[error("file not ready: {0} is {1}")]
    NotReady(String, &'static str),

    /// Storage backend failure
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] GatewayError),
}

impl FileError {
    /// Whether the failure is a store outage the caller may retry later
    pub fn is_retryable(&self) -> bool {
        matches!(self, FileError::Store(e) if e.is_retryable())
    }
}
