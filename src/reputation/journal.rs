//! Event Journal
//!
//! Append-only, hash-deduplicated log of [`ReputationEvent`]s. Used on its
//! own as the event sink of a single node, and as the storage layer of the
//! distributed manager.
//!
//! Every appended event gets a sequence number local to this journal. Peers
//! pull by sequence, so an event that arrives late with an old timestamp is
//! still picked up.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use tokio::sync::RwLock;

use super::event::{EventSink, EventType, ReputationEvent};
use crate::clock::SharedClock;
use crate::error::Result;

#[derive(Debug)]
struct Entry {
    seq: u64,
    event: ReputationEvent,
}

#[derive(Debug, Default)]
struct JournalInner {
    entries: Vec<Entry>,
    hashes: HashSet<String>,
    last_seq: u64,
}

impl JournalInner {
    fn push(&mut self, event: ReputationEvent) -> bool {
        if !self.hashes.insert(event.event_hash.clone()) {
            return false;
        }
        self.last_seq += 1;
        self.entries.push(Entry {
            seq: self.last_seq,
            event,
        });
        true
    }

    fn events(&self) -> impl DoubleEndedIterator<Item = &ReputationEvent> {
        self.entries.iter().map(|e| &e.event)
    }
}

/// Replicable events after a sequence number
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JournalPage {
    pub events: Vec<ReputationEvent>,
    /// Highest sequence number covered by this page
    pub cursor: Option<u64>,
}

/// Journal counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JournalStats {
    pub total: usize,
    pub unsynced: usize,
    pub local_only: usize,
}

#[derive(Debug)]
pub struct EventJournal {
    node_id: String,
    clock: SharedClock,
    inner: RwLock<JournalInner>,
}

impl EventJournal {
    pub fn new(node_id: &str, clock: SharedClock) -> Self {
        Self {
            node_id: node_id.to_string(),
            clock,
            inner: RwLock::new(JournalInner::default()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Stamp an event with this node and the current time, then append it
    pub async fn record_local(&self, mut event: ReputationEvent) -> Option<ReputationEvent> {
        event.stamp(&self.node_id, self.clock.now());
        self.append(event).await
    }

    /// Append an already stamped event unless its hash is known
    pub async fn append(&self, event: ReputationEvent) -> Option<ReputationEvent> {
        let mut inner = self.inner.write().await;
        inner.push(event.clone()).then_some(event)
    }

    pub async fn contains(&self, event_hash: &str) -> bool {
        self.inner.read().await.hashes.contains(event_hash)
    }

    /// Events for a user at or after `since`, newest first
    pub async fn events_for_user(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Vec<ReputationEvent> {
        let inner = self.inner.read().await;
        inner
            .events()
            .rev()
            .filter(|e| e.user_id == user_id)
            .filter(|e| since.map_or(true, |s| e.timestamp >= s))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Replicable events appended after sequence `after`, in append order
    pub async fn replicable_after(&self, after: Option<u64>) -> JournalPage {
        let inner = self.inner.read().await;
        let after_seq = after.unwrap_or(0);
        let events = inner
            .entries
            .iter()
            .filter(|e| e.seq > after_seq && !e.event.local_only)
            .map(|e| e.event.clone())
            .collect();
        JournalPage {
            events,
            cursor: inner.entries.last().map(|e| e.seq).max(after),
        }
    }

    /// Number of events of `event_type` at or after `since`
    pub async fn count_since(&self, event_type: EventType, since: DateTime<Utc>) -> usize {
        let inner = self.inner.read().await;
        inner
            .events()
            .filter(|e| e.event_type == event_type && e.timestamp >= since)
            .count()
    }

    /// Set `synced_at` on the events with these hashes
    pub async fn mark_synced(&self, hashes: &[String], at: DateTime<Utc>) -> usize {
        let wanted: HashSet<&str> = hashes.iter().map(String::as_str).collect();
        let mut inner = self.inner.write().await;
        let mut marked = 0;
        for Entry { event, .. } in inner.entries.iter_mut() {
            if event.synced_at.is_none() && wanted.contains(event.event_hash.as_str()) {
                event.synced_at = Some(at);
                marked += 1;
            }
        }
        marked
    }

    /// Every event, in append order
    pub async fn all(&self) -> Vec<ReputationEvent> {
        self.inner.read().await.events().cloned().collect()
    }

    /// Append events from a snapshot, skipping known hashes
    pub async fn restore(&self, events: Vec<ReputationEvent>) -> usize {
        let mut inner = self.inner.write().await;
        let mut restored = 0;
        for event in events {
            if inner.push(event) {
                restored += 1;
            }
        }
        restored
    }

    /// Drop events older than `before`
    pub async fn prune_before(&self, before: DateTime<Utc>) -> usize {
        let mut inner = self.inner.write().await;
        let JournalInner { entries, hashes, .. } = &mut *inner;
        let count = entries.len();
        entries.retain(|e| {
            let keep = e.event.timestamp >= before;
            if !keep {
                hashes.remove(&e.event.event_hash);
            }
            keep
        });
        count - entries.len()
    }

    pub async fn stats(&self) -> JournalStats {
        let inner = self.inner.read().await;
        JournalStats {
            total: inner.entries.len(),
            unsynced: inner
                .events()
                .filter(|e| !e.local_only && e.synced_at.is_none())
                .count(),
            local_only: inner.events().filter(|e| e.local_only).count(),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl EventSink for EventJournal {
    async fn record_event(&self, event: ReputationEvent) -> Result<Option<ReputationEvent>> {
        Ok(self.record_local(event).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn journal() -> (EventJournal, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        (EventJournal::new("node-a", Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_duplicate_events_are_dropped() {
        let (journal, _clock) = journal();
        let first = journal
            .record_local(ReputationEvent::new("u1", EventType::Violation, -6.0).with_source("api"))
            .await;
        assert!(first.is_some());

        let again = journal
            .record_local(ReputationEvent::new("u1", EventType::Violation, -6.0).with_source("api"))
            .await;
        assert!(again.is_none());
        assert_eq!(journal.len().await, 1);
    }

    #[tokio::test]
    async fn test_user_history_newest_first() {
        let (journal, clock) = journal();
        journal
            .record_local(ReputationEvent::new("u1", EventType::Violation, -3.0))
            .await;
        clock.advance(Duration::seconds(5));
        journal
            .record_local(ReputationEvent::new("u1", EventType::Clean, 4.0))
            .await;
        journal
            .record_local(ReputationEvent::new("u2", EventType::Clean, 4.0))
            .await;

        let history = journal.events_for_user("u1", None, None).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event_type, EventType::Clean);

        let limited = journal.events_for_user("u1", None, Some(1)).await;
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_local_only_events_are_not_replicable() {
        let (journal, _clock) = journal();
        journal
            .record_local(ReputationEvent::new("u1", EventType::Decay, 5.0).local_only())
            .await;
        let replicable = journal
            .record_local(ReputationEvent::new("u1", EventType::Manual, 10.0))
            .await
            .unwrap();

        let page = journal.replicable_after(None).await;
        assert_eq!(page.events, vec![replicable.clone()]);
        assert_eq!(page.cursor, Some(2));

        let stats = journal.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.local_only, 1);
        assert_eq!(stats.unsynced, 1);

        let now = Utc::now();
        assert_eq!(journal.mark_synced(&[replicable.event_hash], now).await, 1);
        assert_eq!(journal.stats().await.unsynced, 0);
    }

    #[tokio::test]
    async fn test_prune_forgets_hashes() {
        let (journal, clock) = journal();
        let event = journal
            .record_local(ReputationEvent::new("u1", EventType::Manual, 1.0))
            .await
            .unwrap();
        clock.advance(Duration::days(40));

        let removed = journal.prune_before(clock.now() - Duration::days(30)).await;
        assert_eq!(removed, 1);
        assert!(!journal.contains(&event.event_hash).await);
    }

    #[tokio::test]
    async fn test_late_events_are_pulled_by_sequence() {
        let (journal, clock) = journal();
        clock.advance(Duration::minutes(5));
        journal
            .record_local(ReputationEvent::new("u1", EventType::Violation, -3.0))
            .await;
        let first = journal.replicable_after(None).await;
        assert_eq!(first.events.len(), 1);

        // Stamped before the event already served, appended after it
        let mut late = ReputationEvent::new("u2", EventType::Violation, -6.0);
        late.stamp("node-b", clock.now() - Duration::minutes(4));
        assert!(journal.append(late.clone()).await.is_some());

        let next = journal.replicable_after(first.cursor).await;
        assert_eq!(next.events, vec![late]);
        assert_eq!(next.cursor, Some(2));

        let empty = journal.replicable_after(next.cursor).await;
        assert!(empty.events.is_empty());
        assert_eq!(empty.cursor, Some(2));
    }
}
