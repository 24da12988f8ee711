//! Replication Error Types

/// Error types for peer replication
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// Connection or transport failure
    #[error("Network error: {0}")]
    Network(String),

    /// Peer answered with a non-success status
    #[error("Peer returned HTTP {0}")]
    HttpStatus(u16),

    /// Request did not complete in time
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    /// No peer registered under this node id
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Batch could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ReplicationError {
    /// Whether a later attempt may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicationError::Network(_) | ReplicationError::Timeout(_) => true,
            ReplicationError::HttpStatus(status) => crate::retry::is_retryable_status(*status),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ReplicationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ReplicationError::Timeout(0)
        } else if err.is_decode() {
            ReplicationError::Serialization(err.to_string())
        } else if let Some(status) = err.status() {
            ReplicationError::HttpStatus(status.as_u16())
        } else {
            ReplicationError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(err: serde_json::Error) -> Self {
        ReplicationError::Serialization(err.to_string())
    }
}
