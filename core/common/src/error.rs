//! Common error types for fieldsync.

use thiserror::Error;

/// Top-level error type for fieldsync operations.
///
/// Variants follow the failure classes of the client core: caller bugs
/// fail fast as [`Error::Precondition`], persistence failures are
/// [`Error::Storage`] and may be retried per operation, and a failed
/// schema upgrade is [`Error::Migration`], which blocks startup.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid argument supplied by the caller.
    #[error("Precondition violated: {0}")]
    Precondition(String),

    /// Persistence operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Schema upgrade failed. The store must not be used.
    #[error("Migration from version {from} to {to} failed at step '{step}': {reason}")]
    Migration {
        from: u32,
        to: u32,
        step: String,
        reason: String,
    },

    /// Remote request failed for a single artifact.
    #[error("Network error: {0}")]
    Network(String),

    /// Remote endpoint unreachable.
    #[error("No connectivity: {0}")]
    Connectivity(String),

    /// Remote rejected the request signature or credentials.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Uploaded content does not match the local checksum.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// A stored invariant was violated.
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation was cancelled before it started.
    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the failed operation may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Storage(_)
                | Error::Network(_)
                | Error::Connectivity(_)
                | Error::Auth(_)
                | Error::NotFound(_)
                | Error::ChecksumMismatch { .. }
                | Error::Io(_)
                | Error::Cancelled
        )
    }

    /// Whether the failure affects every remaining request of a batch,
    /// not only the one that observed it.
    pub fn is_batch_fatal(&self) -> bool {
        matches!(self, Error::Connectivity(_))
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
