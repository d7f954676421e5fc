//! Error types for outbox-core

use thiserror::Error;

use crate::remote::RemoteError;

/// Result type alias using outbox-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in outbox-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation or update not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The durable queue refused a new operation
    #[error("Operation queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Remote data service error
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Non-fatal warning raised once when the durable backend could not be opened
/// and operations are only kept in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurabilityDegraded {
    /// Why the durable backend was unavailable
    pub reason: String,
}

impl std::fmt::Display for DurabilityDegraded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "queued operations are not persisted and will be lost on exit: {}",
            self.reason
        )
    }
}
