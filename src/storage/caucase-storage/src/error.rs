//! Storage error types.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Entry not found (or no longer in the requested state).
    #[error("entry not found: {0}")]
    NotFound(String),

    /// Entry exists or was already consumed.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The pending CSR queue is full.
    #[error("pending CSR quota of {limit} reached")]
    QuotaExceeded {
        /// Configured maximum amount of pending CSRs.
        limit: u64,
    },

    /// The database could not be opened or migrated.
    #[error("connection error: {0}")]
    ConnectionFailed(String),

    /// A query failed.
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Invalid namespace, configuration or row content.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Dump (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}
