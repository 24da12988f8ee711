//! Replication Configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::RetryConfig;

/// A remote node events are pushed to and pulled from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub node_id: String,
    /// Base URL of the peer's server, e.g. `http://10.0.0.2:9100`
    pub endpoint: String,
}

impl PeerConfig {
    pub fn new(node_id: &str, endpoint: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplicationConfig {
    /// Journal through the distributed manager and sync with peers
    #[serde(default)]
    pub enabled: bool,

    /// This node's id (default: hostname)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Seconds between sync rounds (default: 10, 0 disables the worker)
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// Buffered events that force an immediate flush (default: 1000)
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Per-request timeout in seconds (default: 5)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Conflict resolver used by `resolve_user_reputation` (default: "timestamp")
    #[serde(default = "default_resolver")]
    pub conflict_resolver: String,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: default_node_id(),
            sync_interval_secs: default_sync_interval(),
            buffer_capacity: default_buffer_capacity(),
            request_timeout_secs: default_request_timeout(),
            conflict_resolver: default_resolver(),
            retry: RetryConfig::default(),
            peers: Vec::new(),
        }
    }
}

fn default_node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "ratewarden-node".to_string())
}

fn default_sync_interval() -> u64 {
    10 // seconds
}

fn default_buffer_capacity() -> usize {
    1000
}

fn default_request_timeout() -> u64 {
    5 // seconds
}

fn default_resolver() -> String {
    "timestamp".to_string()
}

impl ReplicationConfig {
    /// Configuration for a named node with defaults elsewhere
    pub fn for_node(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            ..Self::default()
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.node_id.trim().is_empty() {
            return Err("node_id must not be empty".to_string());
        }
        if self.buffer_capacity == 0 {
            return Err("buffer_capacity must be at least 1".to_string());
        }
        for peer in &self.peers {
            if peer.node_id == self.node_id {
                return Err(format!("peer {} has this node's own id", peer.node_id));
            }
            if !(peer.endpoint.starts_with("http://") || peer.endpoint.starts_with("https://")) {
                return Err(format!(
                    "peer {} endpoint must be an http(s) URL, got {}",
                    peer.node_id, peer.endpoint
                ));
            }
        }
        Ok(())
    }
}
