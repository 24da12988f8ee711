//! Reputation Events
//!
//! Append-only records of every reputation change. The event hash is a
//! deterministic fingerprint used to drop duplicates under at-least-once
//! replication.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fmt::Debug;

use super::tier::Tier;
use crate::error::Result;

/// Kind of reputation change
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Violation,
    Clean,
    Decay,
    Manual,
    VipAssigned,
    VipRemoved,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Violation => "violation",
            EventType::Clean => "clean",
            EventType::Decay => "decay",
            EventType::Manual => "manual",
            EventType::VipAssigned => "vip_assigned",
            EventType::VipRemoved => "vip_removed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single reputation change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationEvent {
    pub id: String,
    pub user_id: String,
    /// Node that recorded the event
    pub node_id: String,
    pub event_type: EventType,
    pub score_delta: f64,
    pub severity: u8,
    pub source_service: String,
    #[serde(default)]
    pub description: String,
    pub event_hash: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
    /// Never replicated to peers
    #[serde(default)]
    pub local_only: bool,
    /// Absolute score of the user on the recording node after this event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resulting_score: Option<f64>,
}

impl ReputationEvent {
    /// Unstamped event; the recording sink sets node, timestamp and hash
    pub fn new(user_id: &str, event_type: EventType, score_delta: f64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            node_id: String::new(),
            event_type,
            score_delta,
            severity: 0,
            source_service: String::new(),
            description: String::new(),
            event_hash: String::new(),
            timestamp: Utc::now(),
            synced_at: None,
            local_only: false,
            resulting_score: None,
        }
    }

    pub fn with_severity(mut self, severity: u8) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_source(mut self, source_service: &str) -> Self {
        self.source_service = source_service.to_string();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_resulting_score(mut self, score: f64) -> Self {
        self.resulting_score = Some(score);
        self
    }

    pub fn local_only(mut self) -> Self {
        self.local_only = true;
        self
    }

    /// Set node and timestamp, then compute the hash
    pub fn stamp(&mut self, node_id: &str, at: DateTime<Utc>) {
        self.node_id = node_id.to_string();
        self.timestamp = at;
        self.event_hash = self.compute_hash();
    }

    /// Fingerprint of the event's logical content
    pub fn compute_hash(&self) -> String {
        let base = event_hash(
            &self.user_id,
            self.event_type,
            &self.source_service,
            self.score_delta,
            self.timestamp,
        );
        match self.resulting_score {
            // The absolute score is part of the fingerprint
            Some(score) => hex::encode(Sha256::digest(format!("{}:{:.6}", base, score).as_bytes())),
            None => base,
        }
    }

    /// Whether the stored hash matches the content
    pub fn verify_hash(&self) -> bool {
        !self.event_hash.is_empty() && self.event_hash == self.compute_hash()
    }
}

/// SHA-256 over `user:type:source:delta:unix_seconds`, hex encoded
pub fn event_hash(
    user_id: &str,
    event_type: EventType,
    source_service: &str,
    score_delta: f64,
    timestamp: DateTime<Utc>,
) -> String {
    let material = format!(
        "{}:{}:{}:{:.6}:{}",
        user_id,
        event_type,
        source_service,
        score_delta,
        timestamp.timestamp()
    );
    hex::encode(Sha256::digest(material.as_bytes()))
}

/// Destination for reputation changes
///
/// The reputation manager hands every event and every new absolute score
/// to its sink. A standalone node journals locally; a clustered node
/// journals and replicates.
#[async_trait]
pub trait EventSink: Send + Sync + Debug {
    /// Stamp and store an event; `None` means it was a duplicate
    async fn record_event(&self, event: ReputationEvent) -> Result<Option<ReputationEvent>>;

    /// Observe the local node's current view of a user
    async fn observe_score(&self, _user_id: &str, _score: f64, _tier: Tier, _authoritative: bool) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_hash_is_deterministic() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let a = event_hash("42", EventType::Violation, "api", -6.0, ts);
        let b = event_hash("42", EventType::Violation, "api", -6.0, ts);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let c = event_hash("42", EventType::Violation, "api", -3.0, ts);
        assert_ne!(a, c);
    }

    #[test]
    fn test_hash_ignores_sub_second_precision() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let later = ts + chrono::Duration::milliseconds(400);
        assert_eq!(
            event_hash("u", EventType::Clean, "s", 1.0, ts),
            event_hash("u", EventType::Clean, "s", 1.0, later)
        );
    }

    #[test]
    fn test_stamp_sets_hash() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut event = ReputationEvent::new("u1", EventType::Manual, 10.0).with_source("admin");
        assert!(!event.verify_hash());

        event.stamp("node-a", ts);
        assert_eq!(event.node_id, "node-a");
        assert_eq!(event.timestamp, ts);
        assert!(event.verify_hash());

        event.score_delta = 11.0;
        assert!(!event.verify_hash());
    }

    #[test]
    fn test_hash_covers_resulting_score() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut event = ReputationEvent::new("u1", EventType::Manual, 30.0).with_resulting_score(80.0);
        event.stamp("node-a", ts);
        assert!(event.verify_hash());
        assert_ne!(
            event.event_hash,
            event_hash("u1", EventType::Manual, "", 30.0, ts)
        );

        event.resulting_score = Some(95.0);
        assert!(!event.verify_hash());
    }
}
