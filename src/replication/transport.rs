//! Peer transports for event replication.
//!
//! [`HttpTransport`] talks to the `/v1/replication/events` endpoint of a
//! peer's server. [`LoopbackTransport`] connects managers inside one
//! process and is what the integration tests use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::config::PeerConfig;
use super::error::ReplicationError;
use super::manager::DistributedReputationManager;
use crate::reputation::ReputationEvent;
use crate::retry::{attempt_timeout, calculate_retry_delay, RetryConfig, RetryDecision};

/// Path of the peer replication endpoint
pub const EVENTS_PATH: &str = "/v1/replication/events";

/// Events pushed from one node to another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub source_node: String,
    pub sent_at: DateTime<Utc>,
    pub events: Vec<ReputationEvent>,
}

/// Outcome of ingesting a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub accepted: usize,
    pub duplicates: usize,
    /// Events whose hash did not match their content
    pub rejected: usize,
}

/// Body of a pull response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    pub node_id: String,
    pub events: Vec<ReputationEvent>,
    /// Pass back as `after` on the next pull
    #[serde(default)]
    pub cursor: Option<u64>,
}

/// Moves events between this node and a peer
#[async_trait]
pub trait PeerTransport: Send + Sync + Debug {
    /// Deliver a batch; returns how many events the peer accepted
    async fn push(&self, peer: &PeerConfig, batch: &EventBatch) -> Result<usize, ReplicationError>;

    /// Replicable events the peer journalled after sequence `after`
    async fn pull(&self, peer: &PeerConfig, after: Option<u64>) -> Result<PullResponse, ReplicationError>;
}

/// JSON over HTTP with bounded retries
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
    retry: RetryConfig,
}

impl HttpTransport {
    pub fn new(timeout: Duration, retry: RetryConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
            retry,
        }
    }

    fn map_error(&self, err: reqwest::Error, timeout: Duration) -> ReplicationError {
        if err.is_timeout() {
            ReplicationError::Timeout(timeout.as_millis() as u64)
        } else {
            ReplicationError::from(err)
        }
    }

    async fn push_once(
        &self,
        peer: &PeerConfig,
        batch: &EventBatch,
        attempt: u32,
    ) -> Result<usize, ReplicationError> {
        let timeout = attempt_timeout(attempt, self.timeout);
        let url = format!("{}{}", peer.endpoint, EVENTS_PATH);
        let start = Instant::now();

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(batch)
            .send()
            .await
            .map_err(|e| self.map_error(e, timeout))?;

        let status = response.status();
        debug!(
            "Push to {} attempt {} - status {}, {} events, time {} ms",
            peer.node_id,
            attempt,
            status.as_u16(),
            batch.events.len(),
            start.elapsed().as_millis()
        );
        if !status.is_success() {
            return Err(ReplicationError::HttpStatus(status.as_u16()));
        }

        let report: IngestReport = response.json().await.map_err(|e| self.map_error(e, timeout))?;
        Ok(report.accepted)
    }
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn push(&self, peer: &PeerConfig, batch: &EventBatch) -> Result<usize, ReplicationError> {
        let mut attempt = 0;
        loop {
            match self.push_once(peer, batch, attempt).await {
                Ok(accepted) => return Ok(accepted),
                Err(e) if e.is_retryable() => match calculate_retry_delay(attempt, &self.retry) {
                    RetryDecision::Retry(delay_ms) => {
                        warn!(
                            "Push to {} attempt {} failed: {}, retrying in {} ms",
                            peer.node_id, attempt, e, delay_ms
                        );
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        attempt += 1;
                    }
                    RetryDecision::GiveUp => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn pull(&self, peer: &PeerConfig, after: Option<u64>) -> Result<PullResponse, ReplicationError> {
        let mut url = format!("{}{}", peer.endpoint, EVENTS_PATH);
        if let Some(after) = after {
            url.push_str(&format!("?after={}", after));
        }

        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.map_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReplicationError::HttpStatus(status.as_u16()));
        }
        response
            .json()
            .await
            .map_err(|e| self.map_error(e, self.timeout))
    }
}

/// In-process transport between managers of the same process
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    nodes: RwLock<HashMap<String, Weak<DistributedReputationManager>>>,
    unreachable: RwLock<HashSet<String>>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make a manager reachable under its node id
    pub fn attach(&self, manager: &Arc<DistributedReputationManager>) {
        self.nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(manager.node_id().to_string(), Arc::downgrade(manager));
    }

    /// Simulate a network partition to or from a node
    pub fn set_unreachable(&self, node_id: &str, unreachable: bool) {
        let mut set = self.unreachable.write().unwrap_or_else(|e| e.into_inner());
        if unreachable {
            set.insert(node_id.to_string());
        } else {
            set.remove(node_id);
        }
    }

    fn resolve(&self, node_id: &str) -> Result<Arc<DistributedReputationManager>, ReplicationError> {
        if self
            .unreachable
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(node_id)
        {
            return Err(ReplicationError::Network(format!("{} is unreachable", node_id)));
        }
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(node_id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| ReplicationError::PeerNotFound(node_id.to_string()))
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn push(&self, peer: &PeerConfig, batch: &EventBatch) -> Result<usize, ReplicationError> {
        let node = self.resolve(&peer.node_id)?;
        let report = node.ingest_events(batch.events.clone()).await;
        Ok(report.accepted)
    }

    async fn pull(&self, peer: &PeerConfig, after: Option<u64>) -> Result<PullResponse, ReplicationError> {
        let node = self.resolve(&peer.node_id)?;
        Ok(node.events_after(after).await)
    }
}
