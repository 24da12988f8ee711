//! Distributed Reputation Manager
//!
//! Journals reputation events, replicates them to peer nodes and keeps one
//! view of each user per node so that divergent views can be reconciled.
//! Replication is asynchronous and best-effort: nothing here is on the
//! admission path.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::config::{PeerConfig, ReplicationConfig};
use super::resolver::{ConflictResolver, ResolverRegistry};
use super::transport::{EventBatch, HttpTransport, IngestReport, PeerTransport, PullResponse};
use crate::clock::{self, SharedClock};
use crate::error::{Error, Result};
use crate::lifecycle::BackgroundTask;
use crate::metrics::{REPLICATION_ATTEMPTS_TOTAL, REPLICATION_BUFFER_SIZE, REPLICATION_EVENTS_INGESTED_TOTAL};
use crate::reputation::tier::{clamp_score, tier_for_score, NEUTRAL_SCORE};
use crate::reputation::{EventJournal, EventSink, EventType, JournalStats, ReputationEvent, Tier};

/// Health of the link to one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Healthy,
    Degraded,
    Failed,
}

impl PeerStatus {
    /// 0 consecutive errors: healthy, 1 to 3: degraded, more: failed
    pub fn from_errors(consecutive_errors: u32) -> Self {
        match consecutive_errors {
            0 => PeerStatus::Healthy,
            1..=3 => PeerStatus::Degraded,
            _ => PeerStatus::Failed,
        }
    }
}

/// Replication state of one peer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerSync {
    pub remote_node_id: String,
    pub endpoint: String,
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Journal sequence of the last event pulled from this peer
    pub pull_cursor: Option<u64>,
    pub pending_events: usize,
    pub sync_errors: u32,
    pub status: PeerStatus,
}

impl PeerSync {
    fn new(peer: &PeerConfig) -> Self {
        Self {
            remote_node_id: peer.node_id.clone(),
            endpoint: peer.endpoint.clone(),
            last_sync_time: None,
            pull_cursor: None,
            pending_events: 0,
            sync_errors: 0,
            status: PeerStatus::Healthy,
        }
    }

    fn peer(&self) -> PeerConfig {
        PeerConfig {
            node_id: self.remote_node_id.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}

/// One node's view of a user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeReputation {
    pub user_id: String,
    pub node_id: String,
    pub score: f64,
    pub tier: Tier,
    pub last_updated: DateTime<Utc>,
    /// This node's view is the source of truth for the user
    pub is_authoritative: bool,
    /// Time of the override that made this view authoritative
    pub authoritative_at: Option<DateTime<Utc>>,
}

impl NodeReputation {
    pub fn new(user_id: &str, node_id: &str, score: f64, at: DateTime<Utc>) -> Self {
        let score = clamp_score(score);
        Self {
            user_id: user_id.to_string(),
            node_id: node_id.to_string(),
            score,
            tier: tier_for_score(score),
            last_updated: at,
            is_authoritative: false,
            authoritative_at: None,
        }
    }

    fn grant_authority(&mut self, at: DateTime<Utc>) {
        self.is_authoritative = true;
        self.authoritative_at = Some(self.authoritative_at.map_or(at, |t| t.max(at)));
    }

    fn revoke_authority(&mut self) {
        self.is_authoritative = false;
        self.authoritative_at = None;
    }
}

type ViewMap = HashMap<(String, String), NodeReputation>;

/// Hand authority over a user to `node_id` as of `at`
///
/// Returns false, changing nothing, when another node holds a newer
/// override. Otherwise every other view of the user loses authority.
fn claim_authority(views: &mut ViewMap, user_id: &str, node_id: &str, at: DateTime<Utc>) -> bool {
    let superseded = views.values().any(|v| {
        v.user_id == user_id
            && v.node_id != node_id
            && v.is_authoritative
            && v.authoritative_at.map_or(false, |t| t > at)
    });
    if superseded {
        return false;
    }
    for view in views
        .values_mut()
        .filter(|v| v.user_id == user_id && v.node_id != node_id)
    {
        view.revoke_authority();
    }
    true
}

/// Cluster-wide view of a user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Consensus {
    pub user_id: String,
    pub score: f64,
    pub tier: Tier,
    /// Share of nodes agreeing with the returned tier
    pub confidence: f64,
    pub nodes: usize,
    pub authoritative_node: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub node_id: String,
    pub total_nodes: usize,
    pub healthy_nodes: usize,
    pub degraded_nodes: usize,
    pub failed_nodes: usize,
    pub total_pending: usize,
    pub buffer_size: usize,
    pub peers: Vec<PeerSync>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicationStats {
    pub node_id: String,
    pub total_events: usize,
    pub unsynced_events: usize,
    pub local_only_events: usize,
    pub buffer_size: usize,
    pub sync_interval_secs: u64,
    pub remote_nodes: usize,
    pub tracked_views: usize,
}

/// Result of one sync round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncRound {
    /// Events delivered to at least one peer
    pub pushed: usize,
    /// Remote events accepted from pulls
    pub ingested: usize,
}

/// Builder for [`DistributedReputationManager`]
pub struct DistributedReputationManagerBuilder {
    config: ReplicationConfig,
    clock: Option<SharedClock>,
    transport: Option<Arc<dyn PeerTransport>>,
    resolver: Option<Arc<dyn ConflictResolver>>,
}

impl DistributedReputationManagerBuilder {
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn PeerTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Override the resolver named in the configuration
    pub fn resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Build the manager, register configured peers and start the sync worker
    pub fn build(self) -> Result<Arc<DistributedReputationManager>> {
        let config = self.config;
        config.validate().map_err(Error::Validation)?;

        let resolver = match self.resolver {
            Some(resolver) => resolver,
            None => ResolverRegistry::default()
                .get(&config.conflict_resolver)
                .ok_or_else(|| {
                    Error::Validation(format!("unknown conflict resolver: {}", config.conflict_resolver))
                })?,
        };
        let clock = self.clock.unwrap_or_else(clock::system);
        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(HttpTransport::new(config.request_timeout(), config.retry.clone()))
        });
        let journal = Arc::new(EventJournal::new(&config.node_id, clock.clone()));

        let peers: HashMap<String, PeerSync> = config
            .peers
            .iter()
            .map(|p| (p.node_id.clone(), PeerSync::new(p)))
            .collect();

        let manager = Arc::new_cyclic(|weak: &Weak<DistributedReputationManager>| {
            let sync_task = (config.sync_interval_secs > 0).then(|| {
                let weak = weak.clone();
                BackgroundTask::spawn("replication-sync", config.sync_interval(), move || {
                    let weak = weak.clone();
                    async move {
                        if let Some(manager) = weak.upgrade() {
                            manager.sync_once().await;
                        }
                    }
                })
            });

            DistributedReputationManager {
                config,
                journal,
                transport,
                resolver,
                clock,
                peers: RwLock::new(peers),
                buffer: Mutex::new(Vec::new()),
                views: RwLock::new(HashMap::new()),
                weak_self: weak.clone(),
                sync_task,
            }
        });

        info!(
            "Distributed reputation started on node {} with {} peer(s)",
            manager.node_id(),
            manager.config.peers.len()
        );
        Ok(manager)
    }
}

/// Event journal plus peer replication and per-node user views
pub struct DistributedReputationManager {
    config: ReplicationConfig,
    journal: Arc<EventJournal>,
    transport: Arc<dyn PeerTransport>,
    resolver: Arc<dyn ConflictResolver>,
    clock: SharedClock,
    // The registry and the buffer have separate locks; neither is held
    // across network I/O.
    peers: RwLock<HashMap<String, PeerSync>>,
    buffer: Mutex<Vec<ReputationEvent>>,
    views: RwLock<ViewMap>,
    weak_self: Weak<DistributedReputationManager>,
    sync_task: Option<BackgroundTask>,
}

impl std::fmt::Debug for DistributedReputationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedReputationManager")
            .field("node_id", &self.config.node_id)
            .field("transport", &self.transport)
            .field("resolver", &self.resolver.name())
            .finish_non_exhaustive()
    }
}

impl DistributedReputationManager {
    pub fn builder(config: ReplicationConfig) -> DistributedReputationManagerBuilder {
        DistributedReputationManagerBuilder {
            config,
            clock: None,
            transport: None,
            resolver: None,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// The local event journal, shared with the reputation manager
    pub fn journal(&self) -> Arc<EventJournal> {
        self.journal.clone()
    }

    /// Add a peer; returns false if it was already registered
    ///
    /// Re-registering a known peer only updates its endpoint.
    pub fn register_remote_node(&self, node_id: &str, endpoint: &str) -> Result<bool> {
        if node_id.trim().is_empty() || endpoint.trim().is_empty() {
            return Err(Error::Validation("node id and endpoint must not be empty".to_string()));
        }
        if node_id == self.node_id() {
            return Err(Error::Validation(format!("{} is the local node", node_id)));
        }

        let peer = PeerConfig::new(node_id, endpoint);
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        match peers.get_mut(node_id) {
            Some(existing) => {
                existing.endpoint = peer.endpoint;
                Ok(false)
            }
            None => {
                peers.insert(node_id.to_string(), PeerSync::new(&peer));
                info!("Registered remote node {} at {}", node_id, endpoint);
                Ok(true)
            }
        }
    }

    /// Journal an event and queue it for replication
    ///
    /// Returns `None` for an event whose hash is already journalled.
    pub async fn record_event(&self, event: ReputationEvent) -> Result<Option<ReputationEvent>> {
        let recorded = match self.journal.record_local(event).await {
            Some(recorded) => recorded,
            None => {
                debug!("Duplicate reputation event ignored");
                return Ok(None);
            }
        };

        if !recorded.local_only {
            let full = {
                let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
                buffer.push(recorded.clone());
                REPLICATION_BUFFER_SIZE.set(buffer.len() as i64);
                buffer.len() >= self.config.buffer_capacity
            };
            if full {
                self.spawn_flush();
            }
        }
        Ok(Some(recorded))
    }

    fn spawn_flush(&self) {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            if let Some(manager) = weak.upgrade() {
                debug!("Replication buffer full, flushing early");
                manager.flush_buffer().await;
            }
        });
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn peer_list(&self) -> Vec<(PeerConfig, Option<u64>)> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|p| (p.peer(), p.pull_cursor))
            .collect()
    }

    /// Push buffered events to every peer; returns how many were delivered
    ///
    /// Events that no peer accepted stay in the journal and reach peers
    /// through their pulls.
    pub async fn flush_buffer(&self) -> usize {
        let events = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *buffer)
        };
        REPLICATION_BUFFER_SIZE.set(0);
        if events.is_empty() {
            return 0;
        }

        let peers = self.peer_list();
        if peers.is_empty() {
            return 0;
        }

        let batch = Arc::new(EventBatch {
            source_node: self.node_id().to_string(),
            sent_at: self.clock.now(),
            events,
        });

        let mut pushes = JoinSet::new();
        for (peer, _) in peers {
            let transport = self.transport.clone();
            let batch = batch.clone();
            pushes.spawn(async move {
                let result = transport.push(&peer, &batch).await;
                (peer, result)
            });
        }

        let mut delivered = false;
        while let Some(joined) = pushes.join_next().await {
            match joined {
                Ok((peer, Ok(accepted))) => {
                    debug!("Pushed {} events to {} ({} new)", batch.events.len(), peer.node_id, accepted);
                    self.record_sync_attempt(&peer.node_id, "push", 0, true);
                    delivered = true;
                }
                Ok((peer, Err(e))) => {
                    warn!("Replication to {} failed: {}", peer.node_id, e);
                    self.record_sync_attempt(&peer.node_id, "push", batch.events.len(), false);
                }
                Err(e) => warn!("Replication task failed: {}", e),
            }
        }

        if !delivered {
            return 0;
        }
        let hashes: Vec<String> = batch.events.iter().map(|e| e.event_hash.clone()).collect();
        self.journal.mark_synced(&hashes, self.clock.now()).await;
        batch.events.len()
    }

    /// Pull new events from every peer; returns how many were accepted
    pub async fn pull_from_peers(&self) -> usize {
        let mut pulls = JoinSet::new();
        for (peer, cursor) in self.peer_list() {
            let transport = self.transport.clone();
            pulls.spawn(async move {
                let result = transport.pull(&peer, cursor).await;
                (peer, result)
            });
        }

        let mut ingested = 0;
        while let Some(joined) = pulls.join_next().await {
            match joined {
                Ok((peer, Ok(response))) => {
                    let report = self.ingest_events(response.events).await;
                    ingested += report.accepted;
                    self.record_sync_attempt(&peer.node_id, "pull", 0, true);
                    let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
                    if let Some(sync) = peers.get_mut(&peer.node_id) {
                        sync.pull_cursor = sync.pull_cursor.max(response.cursor);
                    }
                }
                Ok((peer, Err(e))) => {
                    warn!("Pull from {} failed: {}", peer.node_id, e);
                    self.record_sync_attempt(&peer.node_id, "pull", 0, false);
                }
                Err(e) => warn!("Pull task failed: {}", e),
            }
        }
        ingested
    }

    /// One flush followed by one pull pass
    pub async fn sync_once(&self) -> SyncRound {
        SyncRound {
            pushed: self.flush_buffer().await,
            ingested: self.pull_from_peers().await,
        }
    }

    fn record_sync_attempt(&self, node_id: &str, direction: &str, event_count: usize, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        REPLICATION_ATTEMPTS_TOTAL
            .with_label_values(&[node_id, direction, outcome])
            .inc();

        let now = self.clock.now();
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        let Some(sync) = peers.get_mut(node_id) else {
            return;
        };

        let previous = sync.status;
        if success {
            sync.sync_errors = 0;
            sync.last_sync_time = Some(now);
            if direction == "push" {
                sync.pending_events = 0;
            }
        } else {
            sync.sync_errors = sync.sync_errors.saturating_add(1);
            sync.pending_events += event_count;
        }
        sync.status = PeerStatus::from_errors(sync.sync_errors);

        if sync.status != previous {
            info!(
                "Peer {} is now {:?} ({} consecutive errors)",
                node_id, sync.status, sync.sync_errors
            );
        }
    }

    /// Accept events from a peer
    ///
    /// Events with a bad hash are rejected, known hashes are skipped, and
    /// every accepted event moves the origin node's view of its user.
    pub async fn ingest_events(&self, events: Vec<ReputationEvent>) -> IngestReport {
        let mut report = IngestReport::default();
        let now = self.clock.now();

        for mut event in events {
            if !event.verify_hash() {
                warn!("Rejected event {} from {}: hash mismatch", event.id, event.node_id);
                report.rejected += 1;
                continue;
            }
            if event.node_id == self.node_id() {
                report.duplicates += 1;
                continue;
            }

            event.synced_at = Some(now);
            match self.journal.append(event).await {
                Some(event) => {
                    self.apply_remote(&event);
                    report.accepted += 1;
                }
                None => report.duplicates += 1,
            }
        }

        if report.accepted > 0 {
            REPLICATION_EVENTS_INGESTED_TOTAL.inc_by(report.accepted as u64);
            debug!(
                "Ingested {} events ({} duplicates, {} rejected)",
                report.accepted, report.duplicates, report.rejected
            );
        }
        report
    }

    fn apply_remote(&self, event: &ReputationEvent) {
        let mut views = self.views.write().unwrap_or_else(|e| e.into_inner());
        let takes_authority = event.event_type == EventType::Manual
            && claim_authority(&mut views, &event.user_id, &event.node_id, event.timestamp);

        let view = views
            .entry((event.user_id.clone(), event.node_id.clone()))
            .or_insert_with(|| NodeReputation::new(&event.user_id, &event.node_id, NEUTRAL_SCORE, event.timestamp));

        match event.resulting_score {
            // Older absolute scores arriving late do not overwrite newer ones
            Some(score) if event.timestamp >= view.last_updated => view.score = clamp_score(score),
            Some(_) => {}
            None => view.score = clamp_score(view.score + event.score_delta),
        }
        view.tier = tier_for_score(view.score);
        view.last_updated = view.last_updated.max(event.timestamp);
        if takes_authority {
            view.grant_authority(event.timestamp);
        }
    }

    /// Replicable events journalled after sequence `after`
    pub async fn events_after(&self, after: Option<u64>) -> PullResponse {
        let page = self.journal.replicable_after(after).await;
        PullResponse {
            node_id: self.node_id().to_string(),
            events: page.events,
            cursor: page.cursor,
        }
    }

    /// Insert or replace one node's view of a user
    pub fn upsert_node_reputation(&self, view: NodeReputation) {
        self.views
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((view.user_id.clone(), view.node_id.clone()), view);
    }

    /// Every node's view of a user, ordered by node id
    pub fn node_reputations(&self, user_id: &str) -> Vec<NodeReputation> {
        let views = self.views.read().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<NodeReputation> = views
            .values()
            .filter(|v| v.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        rows
    }

    /// Reconciled view of a user across nodes
    ///
    /// An authoritative view wins outright. Otherwise the score is the mean
    /// and the tier the majority vote, with ties going to the more
    /// restrictive tier.
    pub fn get_user_reputation_consensus(&self, user_id: &str) -> Result<Consensus> {
        let rows = self.node_reputations(user_id);
        if rows.is_empty() {
            return Err(Error::NotFound(format!("no reputation views for user {}", user_id)));
        }

        if let Some(authority) = rows
            .iter()
            .filter(|r| r.is_authoritative)
            .max_by_key(|r| r.authoritative_at)
        {
            return Ok(Consensus {
                user_id: user_id.to_string(),
                score: authority.score,
                tier: authority.tier,
                confidence: 1.0,
                nodes: rows.len(),
                authoritative_node: Some(authority.node_id.clone()),
            });
        }

        let total = rows.len();
        let score = rows.iter().map(|r| r.score).sum::<f64>() / total as f64;

        let mut votes: BTreeMap<Tier, usize> = BTreeMap::new();
        for row in &rows {
            *votes.entry(row.tier).or_default() += 1;
        }
        // Ascending order, so a tie keeps the more restrictive tier
        let (tier, agreeing) = votes
            .iter()
            .fold((Tier::Standard, 0), |best, (tier, count)| {
                if *count > best.1 {
                    (*tier, *count)
                } else {
                    best
                }
            });

        Ok(Consensus {
            user_id: user_id.to_string(),
            score,
            tier,
            confidence: 1.0 - (total - agreeing) as f64 / total as f64,
            nodes: total,
            authoritative_node: None,
        })
    }

    /// Reconcile every view of a user against the most recently updated one
    ///
    /// The newest view becomes authoritative. Returns how many other views
    /// were rewritten.
    pub fn resolve_user_reputation(&self, user_id: &str) -> Result<usize> {
        let now = self.clock.now();
        let mut views = self.views.write().unwrap_or_else(|e| e.into_inner());

        let newest = views
            .values()
            .filter(|v| v.user_id == user_id)
            .max_by(|a, b| {
                a.last_updated
                    .cmp(&b.last_updated)
                    .then_with(|| b.node_id.cmp(&a.node_id))
            })
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no reputation views for user {}", user_id)))?;

        let mut rewritten = 0;
        for view in views.values_mut().filter(|v| v.user_id == user_id) {
            if view.node_id == newest.node_id {
                view.grant_authority(newest.last_updated);
                continue;
            }
            view.revoke_authority();
            let score = self
                .resolver
                .resolve_score(view.score, newest.score, view.last_updated, newest.last_updated);
            if score != view.score {
                view.score = score;
                view.tier = if score == newest.score {
                    newest.tier
                } else {
                    self.resolver
                        .resolve_tier(view.tier, newest.tier, view.last_updated, newest.last_updated)
                };
                view.last_updated = now;
                rewritten += 1;
            }
        }

        if rewritten > 0 {
            info!(
                "Resolved {} conflicting view(s) of user {} against node {}",
                rewritten, user_id, newest.node_id
            );
        }
        Ok(rewritten)
    }

    pub fn get_sync_status(&self) -> SyncStatus {
        let buffer_size = self.buffer_len();
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<PeerSync> = peers.values().cloned().collect();
        list.sort_by(|a, b| a.remote_node_id.cmp(&b.remote_node_id));

        let count = |status: PeerStatus| list.iter().filter(|p| p.status == status).count();
        SyncStatus {
            node_id: self.node_id().to_string(),
            total_nodes: list.len(),
            healthy_nodes: count(PeerStatus::Healthy),
            degraded_nodes: count(PeerStatus::Degraded),
            failed_nodes: count(PeerStatus::Failed),
            total_pending: list.iter().map(|p| p.pending_events).sum(),
            buffer_size,
            peers: list,
        }
    }

    pub async fn get_replication_stats(&self) -> ReplicationStats {
        let JournalStats {
            total,
            unsynced,
            local_only,
        } = self.journal.stats().await;

        ReplicationStats {
            node_id: self.node_id().to_string(),
            total_events: total,
            unsynced_events: unsynced,
            local_only_events: local_only,
            buffer_size: self.buffer_len(),
            sync_interval_secs: self.config.sync_interval_secs,
            remote_nodes: self.peers.read().unwrap_or_else(|e| e.into_inner()).len(),
            tracked_views: self.views.read().unwrap_or_else(|e| e.into_inner()).len(),
        }
    }

    /// Stop the sync worker and make a last attempt to push buffered events
    pub async fn close(&self) {
        let stopped = self.sync_task.as_ref().map_or(false, |t| t.stop());
        if stopped {
            let pushed = self.flush_buffer().await;
            info!("Replication stopped on node {} ({} events flushed)", self.node_id(), pushed);
        }
    }
}

impl Drop for DistributedReputationManager {
    fn drop(&mut self) {
        if let Some(task) = &self.sync_task {
            task.stop();
        }
    }
}

#[async_trait]
impl EventSink for DistributedReputationManager {
    async fn record_event(&self, event: ReputationEvent) -> Result<Option<ReputationEvent>> {
        DistributedReputationManager::record_event(self, event).await
    }

    async fn observe_score(&self, user_id: &str, score: f64, tier: Tier, authoritative: bool) -> Result<()> {
        let now = self.clock.now();
        let mut views = self.views.write().unwrap_or_else(|e| e.into_inner());
        let takes_authority = authoritative && claim_authority(&mut views, user_id, self.node_id(), now);

        let view = views
            .entry((user_id.to_string(), self.node_id().to_string()))
            .or_insert_with(|| NodeReputation::new(user_id, &self.config.node_id, score, now));
        view.score = clamp_score(score);
        view.tier = tier;
        view.last_updated = now;
        if takes_authority {
            view.grant_authority(now);
        }
        Ok(())
    }
}
