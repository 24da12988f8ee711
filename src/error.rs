//! Error Types
//!
//! Errors surfaced by the library. Lookups that may legitimately find
//! nothing return `Option` instead of `Error::NotFound`.

use crate::replication::ReplicationError;

/// Error types for admission-control operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed rule, request or admin input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transient storage failure during a check or update
    #[error("Store error: {0}")]
    Store(String),

    /// The request context was cancelled or its deadline passed
    #[error("Operation cancelled")]
    Cancelled,

    /// Peer replication failure
    #[error(transparent)]
    Replication(#[from] ReplicationError),

    /// Snapshot I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot or payload encoding failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Store(_) | Error::Replication(_) | Error::Io(_))
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::Store(_) => "store",
            Error::Cancelled => "cancelled",
            Error::Replication(_) => "replication",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
