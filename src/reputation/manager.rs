//! Reputation Manager
//!
//! Keeps a score per user, adjusts it on violations, clean requests,
//! manual overrides and periodic decay, and exposes the limit multiplier
//! derived from it. Every change is handed to an [`EventSink`]; reads go
//! through a short-lived cache that writers invalidate.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use super::config::ReputationConfig;
use super::event::{EventSink, EventType, ReputationEvent};
use super::journal::EventJournal;
use super::store::{decay_toward, ReputationSnapshot, ReputationStore, UserReputation};
use super::tier::{Tier, VipTier, MAX_SCORE, NEUTRAL_SCORE};
use crate::cache::TtlCache;
use crate::clock::{self, SharedClock};
use crate::error::{Error, Result};
use crate::lifecycle::BackgroundTask;
use crate::metrics::{REPUTATION_DECAYED_USERS_TOTAL, REPUTATION_EVENTS_TOTAL};
use crate::notify::{Notification, NotificationKind, NotifierRegistry, Severity};
use crate::rate_limit::decision::final_limit;

/// Scores below this count as suspended in statistics
pub const SUSPENDED_SCORE: f64 = 10.0;

/// Aggregate view across all users
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepStats {
    pub total_users: usize,
    pub average_score: f64,
    pub tier_distribution: BTreeMap<String, usize>,
    pub users_flagged: usize,
    pub users_suspended: usize,
    pub vip_users: usize,
    pub violations_today: usize,
}

/// Net change of one user on one day
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub score_delta: f64,
    pub events: usize,
}

/// One page of users, worst scores first
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserPage {
    pub users: Vec<UserReputation>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
}

/// Builder for [`ReputationManager`]
pub struct ReputationManagerBuilder {
    config: ReputationConfig,
    clock: Option<SharedClock>,
    journal: Option<Arc<EventJournal>>,
    sink: Option<Arc<dyn EventSink>>,
    notifier: Option<Arc<NotifierRegistry>>,
}

impl ReputationManagerBuilder {
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Journal queried for history; also the sink unless one is set
    pub fn journal(mut self, journal: Arc<EventJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Destination for new events, e.g. a replicating manager
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn notifier(mut self, notifier: Arc<NotifierRegistry>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Restore the snapshot, if any, and start the periodic jobs
    ///
    /// Must be called from within a tokio runtime.
    pub async fn build(self) -> Result<Arc<ReputationManager>> {
        self.config.validate().map_err(Error::Validation)?;

        let clock = self.clock.unwrap_or_else(clock::system);
        let journal = self
            .journal
            .unwrap_or_else(|| Arc::new(EventJournal::new("local", clock.clone())));
        let sink: Arc<dyn EventSink> = match self.sink {
            Some(sink) => sink,
            None => journal.clone(),
        };

        let store = ReputationStore::new();
        let snapshot_path = self.config.snapshot_path.as_ref().map(PathBuf::from);
        if let Some(path) = &snapshot_path {
            if let Some(snapshot) = ReputationSnapshot::load(path).await? {
                let users = store.restore(snapshot.users).await;
                let events = journal.restore(snapshot.events).await;
                info!(
                    "Restored {} users and {} events from {}",
                    users,
                    events,
                    path.display()
                );
            }
        }

        let config = self.config;
        let notifier = self.notifier;
        let manager = Arc::new_cyclic(|weak: &Weak<ReputationManager>| {
            let mut tasks = Vec::new();

            if config.decay_interval_secs > 0 {
                let weak = weak.clone();
                tasks.push(BackgroundTask::spawn(
                    "reputation-decay",
                    config.decay_interval(),
                    move || {
                        let weak = weak.clone();
                        async move {
                            if let Some(manager) = weak.upgrade() {
                                if let Err(e) = manager.apply_rep_decay_all().await {
                                    warn!("Reputation decay failed: {}", e);
                                }
                            }
                        }
                    },
                ));
            }

            if snapshot_path.is_some() && config.snapshot_interval_secs > 0 {
                let weak = weak.clone();
                tasks.push(BackgroundTask::spawn(
                    "reputation-snapshot",
                    config.snapshot_interval(),
                    move || {
                        let weak = weak.clone();
                        async move {
                            if let Some(manager) = weak.upgrade() {
                                if let Err(e) = manager.save_snapshot().await {
                                    warn!("Reputation snapshot failed: {}", e);
                                }
                            }
                        }
                    },
                ));
            }

            ReputationManager {
                cache: TtlCache::new(config.cache_ttl(), config.cache_size),
                config,
                store,
                journal,
                sink,
                notifier,
                clock,
                snapshot_path,
                tasks,
            }
        });

        Ok(manager)
    }
}

/// Per-user reputation scores and their adaptive multipliers
pub struct ReputationManager {
    config: ReputationConfig,
    store: ReputationStore,
    journal: Arc<EventJournal>,
    sink: Arc<dyn EventSink>,
    cache: TtlCache<String, UserReputation>,
    notifier: Option<Arc<NotifierRegistry>>,
    clock: SharedClock,
    snapshot_path: Option<PathBuf>,
    tasks: Vec<BackgroundTask>,
}

impl std::fmt::Debug for ReputationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReputationManager")
            .field("config", &self.config)
            .field("sink", &self.sink)
            .finish_non_exhaustive()
    }
}

fn validate_user(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(Error::Validation("user id must not be empty".to_string()));
    }
    Ok(())
}

impl ReputationManager {
    pub fn builder(config: ReputationConfig) -> ReputationManagerBuilder {
        ReputationManagerBuilder {
            config,
            clock: None,
            journal: None,
            sink: None,
            notifier: None,
        }
    }

    pub fn config(&self) -> &ReputationConfig {
        &self.config
    }

    pub fn journal(&self) -> &Arc<EventJournal> {
        &self.journal
    }

    /// Current reputation; an unseen user starts at the initial score
    pub async fn get_user_reputation(&self, user_id: &str) -> Result<UserReputation> {
        validate_user(user_id)?;
        let now = self.clock.now();
        let key = user_id.to_string();

        if let Some(mut user) = self.cache.get(&key) {
            // VIP expiry is re-evaluated on every read
            user.refresh(now);
            return Ok(user);
        }

        // Writers invalidate after updating the store, so a row read before
        // an invalidation is returned but not cached
        let generation = self.cache.generation();
        let mut user = self
            .store
            .get_or_create(user_id, self.config.initial_score, now)
            .await;
        user.refresh(now);
        self.cache.insert_if_current(key, user.clone(), generation);
        Ok(user)
    }

    /// Penalize a user by `severity` × the configured penalty, floored at 0
    pub async fn record_violation(&self, user_id: &str, severity: u8, description: &str) -> Result<UserReputation> {
        validate_user(user_id)?;
        if !(1..=3).contains(&severity) {
            return Err(Error::Validation(format!(
                "severity must be between 1 and 3, got {}",
                severity
            )));
        }

        let now = self.clock.now();
        let penalty = severity as f64 * self.config.violation_penalty;
        let mut previous_tier = Tier::Standard;
        let user = self
            .store
            .update(user_id, self.config.initial_score, now, |u| {
                previous_tier = u.tier;
                u.score = (u.score - penalty).max(0.0);
                u.violation_count += 1;
                u.last_violation = Some(now);
            })
            .await;
        self.cache.invalidate(&user.user_id);

        let event = ReputationEvent::new(user_id, EventType::Violation, -penalty)
            .with_severity(severity)
            .with_source(&self.config.source_service)
            .with_description(description)
            .with_resulting_score(user.score);
        self.journal_event(event).await?;
        self.observe(&user, false).await;

        debug!(
            "Violation for user {} (severity {}): score {:.1}, tier {}",
            user_id, severity, user.score, user.tier
        );
        if user.tier == Tier::Flagged && previous_tier != Tier::Flagged {
            self.notify_flagged(&user);
        }
        Ok(user)
    }

    /// Reward a clean request
    ///
    /// Only every `clean_event_interval`-th request is journalled, carrying
    /// the score gained since the previous clean event.
    pub async fn record_clean_request(&self, user_id: &str) -> Result<UserReputation> {
        validate_user(user_id)?;
        let now = self.clock.now();
        let reward = self.config.clean_reward;
        let interval = self.config.clean_event_interval.max(1);
        let mut journal_delta = None;

        let user = self
            .store
            .update(user_id, self.config.initial_score, now, |u| {
                let before = u.score;
                u.score = (u.score + reward).min(MAX_SCORE);
                u.pending_clean_delta += u.score - before;
                u.clean_requests += 1;
                if u.clean_requests % interval == 0 {
                    journal_delta = Some(u.pending_clean_delta);
                    u.pending_clean_delta = 0.0;
                }
            })
            .await;
        self.cache.invalidate(&user.user_id);

        if let Some(delta) = journal_delta {
            let event = ReputationEvent::new(user_id, EventType::Clean, delta)
                .with_source(&self.config.source_service)
                .with_description(&format!("{} clean requests", interval))
                .with_resulting_score(user.score);
            self.journal_event(event).await?;
            self.observe(&user, false).await;
        }
        Ok(user)
    }

    /// Move one user a single decay step toward neutral
    pub async fn apply_rep_decay(&self, user_id: &str) -> Result<UserReputation> {
        validate_user(user_id)?;
        let now = self.clock.now();
        let step = self.config.decay_step;
        let mut delta = 0.0;

        let user = self
            .store
            .update(user_id, self.config.initial_score, now, |u| {
                let next = decay_toward(u.score, NEUTRAL_SCORE, step);
                if next != u.score {
                    delta = next - u.score;
                    u.score = next;
                    u.decay_last_applied = Some(now);
                }
            })
            .await;
        self.cache.invalidate(&user.user_id);

        if delta != 0.0 {
            self.journal_decay(user_id, delta, user.score).await?;
            self.observe(&user, false).await;
            REPUTATION_DECAYED_USERS_TOTAL.inc();
        }
        Ok(user)
    }

    /// Decay every non-neutral user in one pass, returning how many moved
    pub async fn apply_rep_decay_all(&self) -> Result<usize> {
        let now = self.clock.now();
        let changes = self
            .store
            .decay_all(NEUTRAL_SCORE, self.config.decay_step, now)
            .await;

        for change in &changes {
            self.cache.invalidate(&change.user_id);
            self.journal_decay(&change.user_id, change.new_score - change.old_score, change.new_score)
                .await?;
            if let Err(e) = self
                .sink
                .observe_score(&change.user_id, change.new_score, change.tier, false)
                .await
            {
                warn!("Failed to publish decayed score for {}: {}", change.user_id, e);
            }
        }

        REPUTATION_DECAYED_USERS_TOTAL.inc_by(changes.len() as u64);
        info!("Reputation decay moved {} user(s) toward neutral", changes.len());
        Ok(changes.len())
    }

    /// Assign a VIP overlay; `expires_at` must be in the future
    pub async fn set_vip_tier(
        &self,
        user_id: &str,
        vip: VipTier,
        expires_at: Option<DateTime<Utc>>,
        reason: &str,
    ) -> Result<UserReputation> {
        validate_user(user_id)?;
        let now = self.clock.now();
        if let Some(expires) = expires_at {
            if expires <= now {
                return Err(Error::Validation(format!(
                    "VIP expiry {} is not in the future",
                    expires
                )));
            }
        }

        let user = self
            .store
            .update(user_id, self.config.initial_score, now, |u| {
                u.vip_tier = Some(vip);
                u.vip_expires_at = expires_at;
            })
            .await;
        self.cache.invalidate(&user.user_id);

        let event = ReputationEvent::new(user_id, EventType::VipAssigned, 0.0)
            .with_source(&self.config.source_service)
            .with_description(&format!("{}: {}", vip, reason))
            .with_resulting_score(user.score);
        self.journal_event(event).await?;
        info!("Assigned VIP tier {} to user {}", vip, user_id);
        Ok(user)
    }

    /// Remove any VIP overlay
    pub async fn remove_vip_tier(&self, user_id: &str, reason: &str) -> Result<UserReputation> {
        validate_user(user_id)?;
        let now = self.clock.now();
        let mut removed = None;

        let user = self
            .store
            .update(user_id, self.config.initial_score, now, |u| {
                removed = u.vip_tier.take();
                u.vip_expires_at = None;
            })
            .await;
        self.cache.invalidate(&user.user_id);

        if let Some(vip) = removed {
            let event = ReputationEvent::new(user_id, EventType::VipRemoved, 0.0)
                .with_source(&self.config.source_service)
                .with_description(&format!("{}: {}", vip, reason))
                .with_resulting_score(user.score);
            self.journal_event(event).await?;
            info!("Removed VIP tier {} from user {}", vip, user_id);
        }
        Ok(user)
    }

    /// Administrative override of the score
    ///
    /// The resulting view is published as authoritative so that replicas
    /// converge on it.
    pub async fn set_user_reputation(&self, user_id: &str, score: f64, reason: &str) -> Result<UserReputation> {
        validate_user(user_id)?;
        if !score.is_finite() || !(0.0..=MAX_SCORE).contains(&score) {
            return Err(Error::Validation(format!(
                "score must be within 0..=100, got {}",
                score
            )));
        }

        let now = self.clock.now();
        let mut previous = (self.config.initial_score, Tier::Standard);
        let user = self
            .store
            .update(user_id, self.config.initial_score, now, |u| {
                previous = (u.score, u.tier);
                u.score = score;
            })
            .await;
        self.cache.invalidate(&user.user_id);

        let event = ReputationEvent::new(user_id, EventType::Manual, score - previous.0)
            .with_source(&self.config.source_service)
            .with_description(reason)
            .with_resulting_score(score);
        self.journal_event(event).await?;
        self.observe(&user, true).await;

        info!(
            "Reputation of user {} set to {:.1} (was {:.1}): {}",
            user_id, score, previous.0, reason
        );
        if user.tier == Tier::Flagged && previous.1 != Tier::Flagged {
            self.notify_flagged(&user);
        }
        Ok(user)
    }

    /// `floor(base × multiplier)` for a user
    pub async fn get_adaptive_limit(&self, user_id: &str, base_limit: u32) -> Result<u32> {
        let user = self.get_user_reputation(user_id).await?;
        Ok(final_limit(base_limit, user.multiplier, 1.0))
    }

    /// The user's limit multiplier
    pub async fn get_multiplier(&self, user_id: &str) -> Result<f64> {
        Ok(self.get_user_reputation(user_id).await?.multiplier)
    }

    /// Events of the last `days` days, newest first
    pub async fn get_rep_history(&self, user_id: &str, days: u32) -> Result<Vec<ReputationEvent>> {
        validate_user(user_id)?;
        let since = self.clock.now() - Duration::days(days as i64);
        Ok(self.journal.events_for_user(user_id, Some(since), None).await)
    }

    /// Most recent `limit` events, newest first
    pub async fn get_user_events(&self, user_id: &str, limit: usize) -> Result<Vec<ReputationEvent>> {
        validate_user(user_id)?;
        Ok(self.journal.events_for_user(user_id, None, Some(limit)).await)
    }

    /// Per-day score change over the last `days` days, newest first
    pub async fn get_rep_trends(&self, user_id: &str, days: u32) -> Result<Vec<TrendPoint>> {
        let events = self.get_rep_history(user_id, days).await?;
        let mut by_day: BTreeMap<NaiveDate, TrendPoint> = BTreeMap::new();
        for event in events {
            let date = event.timestamp.date_naive();
            let point = by_day.entry(date).or_insert(TrendPoint {
                date,
                score_delta: 0.0,
                events: 0,
            });
            point.score_delta += event.score_delta;
            point.events += 1;
        }
        Ok(by_day.into_values().rev().collect())
    }

    /// Users ordered by score ascending, `page` starting at 1
    pub async fn get_all_users(&self, page: usize, per_page: usize) -> UserPage {
        let page = page.max(1);
        let per_page = per_page.clamp(1, 1000);
        let now = self.clock.now();

        let mut users = self.store.all().await;
        for user in users.iter_mut() {
            user.refresh(now);
        }
        users.sort_by(|a, b| {
            a.score
                .total_cmp(&b.score)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });

        let total = users.len();
        let users = users
            .into_iter()
            .skip((page - 1) * per_page)
            .take(per_page)
            .collect();
        UserPage {
            users,
            total,
            page,
            per_page,
        }
    }

    pub async fn get_rep_stats(&self) -> RepStats {
        let now = self.clock.now();
        let users = self.store.all().await;

        let mut tier_distribution: BTreeMap<String, usize> = [Tier::Flagged, Tier::Standard, Tier::Trusted]
            .iter()
            .map(|t| (t.to_string(), 0))
            .collect();
        let mut total_score = 0.0;
        let mut users_suspended = 0;
        let mut vip_users = 0;
        for user in &users {
            total_score += user.score;
            *tier_distribution.entry(user.tier.to_string()).or_insert(0) += 1;
            if user.score < SUSPENDED_SCORE {
                users_suspended += 1;
            }
            if user.active_vip(now).is_some() {
                vip_users += 1;
            }
        }

        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .unwrap_or(now);

        RepStats {
            total_users: users.len(),
            average_score: if users.is_empty() {
                0.0
            } else {
                total_score / users.len() as f64
            },
            users_flagged: tier_distribution.get("flagged").copied().unwrap_or(0),
            tier_distribution,
            users_suspended,
            vip_users,
            violations_today: self.journal.count_since(EventType::Violation, midnight).await,
        }
    }

    /// Drop journal events older than `before`
    pub async fn cleanup_old_events(&self, before: DateTime<Utc>) -> usize {
        let removed = self.journal.prune_before(before).await;
        if removed > 0 {
            debug!("Pruned {} reputation events", removed);
        }
        removed
    }

    /// Write users and events to the configured snapshot file
    ///
    /// Returns `false` when no snapshot path is configured.
    pub async fn save_snapshot(&self) -> Result<bool> {
        let Some(path) = &self.snapshot_path else {
            return Ok(false);
        };
        let snapshot = ReputationSnapshot {
            saved_at: self.clock.now(),
            users: self.store.all().await,
            events: self.journal.all().await,
        };
        snapshot.save(path).await?;
        debug!("Saved reputation snapshot to {}", path.display());
        Ok(true)
    }

    /// Stop the periodic jobs and write a final snapshot
    pub async fn close(&self) -> Result<()> {
        for task in &self.tasks {
            task.stop();
        }
        self.save_snapshot().await?;
        Ok(())
    }

    async fn journal_decay(&self, user_id: &str, delta: f64, score: f64) -> Result<()> {
        // Every node decays on its own schedule, so decay never replicates
        let event = ReputationEvent::new(user_id, EventType::Decay, delta)
            .with_source(&self.config.source_service)
            .with_description("periodic decay toward neutral")
            .with_resulting_score(score)
            .local_only();
        self.journal_event(event).await
    }

    async fn journal_event(&self, event: ReputationEvent) -> Result<()> {
        let event_type = event.event_type;
        if self.sink.record_event(event).await?.is_some() {
            REPUTATION_EVENTS_TOTAL
                .with_label_values(&[event_type.as_str()])
                .inc();
        }
        Ok(())
    }

    async fn observe(&self, user: &UserReputation, authoritative: bool) {
        if let Err(e) = self
            .sink
            .observe_score(&user.user_id, user.score, user.tier, authoritative)
            .await
        {
            warn!("Failed to publish score for {}: {}", user.user_id, e);
        }
    }

    fn notify_flagged(&self, user: &UserReputation) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let notification = Notification::new(
            NotificationKind::ReputationFlagged,
            Severity::Warning,
            "User flagged",
            &format!("User {} dropped to score {:.1}", user.user_id, user.score),
        )
        .with_data(serde_json::json!({
            "user_id": user.user_id,
            "score": user.score,
            "violation_count": user.violation_count,
        }));
        notifier.dispatch_in_background(notification);
    }
}
