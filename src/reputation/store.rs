//! User reputation table
//!
//! Every read-modify-write of a score happens under one write lock so
//! concurrent violations and clean requests never lose an update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;

use super::event::ReputationEvent;
use super::tier::{clamp_score, effective_multiplier, tier_for_score, Tier, VipTier};
use crate::error::Result;

/// One user's reputation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserReputation {
    pub user_id: String,
    pub score: f64,
    pub tier: Tier,
    /// Limit multiplier including any active VIP overlay
    pub multiplier: f64,
    pub vip_tier: Option<VipTier>,
    pub vip_expires_at: Option<DateTime<Utc>>,
    pub violation_count: u64,
    pub clean_requests: u64,
    /// Score gained by clean requests not yet journalled
    #[serde(default)]
    pub pending_clean_delta: f64,
    pub last_violation: Option<DateTime<Utc>>,
    pub decay_last_applied: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserReputation {
    pub fn new(user_id: &str, score: f64, now: DateTime<Utc>) -> Self {
        let mut user = Self {
            user_id: user_id.to_string(),
            score: clamp_score(score),
            tier: Tier::Standard,
            multiplier: 1.0,
            vip_tier: None,
            vip_expires_at: None,
            violation_count: 0,
            clean_requests: 0,
            pending_clean_delta: 0.0,
            last_violation: None,
            decay_last_applied: None,
            created_at: now,
            updated_at: now,
        };
        user.refresh(now);
        user
    }

    /// VIP tier if assigned and not expired at `now`
    pub fn active_vip(&self, now: DateTime<Utc>) -> Option<VipTier> {
        match (self.vip_tier, self.vip_expires_at) {
            (Some(_), Some(expires)) if expires <= now => None,
            (vip, _) => vip,
        }
    }

    /// Recompute tier and multiplier from the score
    pub fn refresh(&mut self, now: DateTime<Utc>) {
        self.score = clamp_score(self.score);
        self.tier = tier_for_score(self.score);
        self.multiplier = effective_multiplier(self.score, self.active_vip(now));
    }
}

/// On-disk snapshot of users and journal events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationSnapshot {
    pub saved_at: DateTime<Utc>,
    pub users: Vec<UserReputation>,
    #[serde(default)]
    pub events: Vec<ReputationEvent>,
}

impl ReputationSnapshot {
    /// Write atomically through a temporary sibling file
    pub async fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Read a snapshot; a missing file yields `None`
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// A user whose score was moved by a bulk decay
#[derive(Debug, Clone, PartialEq)]
pub struct DecayChange {
    pub user_id: String,
    pub old_score: f64,
    pub new_score: f64,
    pub tier: Tier,
}

#[derive(Debug, Default)]
pub struct ReputationStore {
    users: RwLock<HashMap<String, UserReputation>>,
}

impl ReputationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, user_id: &str) -> Option<UserReputation> {
        self.users.read().await.get(user_id).cloned()
    }

    /// Existing row, or a new one with `initial_score`
    pub async fn get_or_create(&self, user_id: &str, initial_score: f64, now: DateTime<Utc>) -> UserReputation {
        if let Some(user) = self.get(user_id).await {
            return user;
        }
        let mut users = self.users.write().await;
        users
            .entry(user_id.to_string())
            .or_insert_with(|| UserReputation::new(user_id, initial_score, now))
            .clone()
    }

    /// Apply `f` to a user, creating the row with `initial_score` first
    ///
    /// The whole read-modify-write runs under the table's write lock.
    /// Returns the row after tier and multiplier are recomputed.
    pub async fn update<F>(&self, user_id: &str, initial_score: f64, now: DateTime<Utc>, f: F) -> UserReputation
    where
        F: FnOnce(&mut UserReputation),
    {
        let mut users = self.users.write().await;
        let user = users
            .entry(user_id.to_string())
            .or_insert_with(|| UserReputation::new(user_id, initial_score, now));
        f(user);
        user.updated_at = now;
        user.refresh(now);
        user.clone()
    }

    /// Move every non-neutral score toward `target` by at most `step`
    pub async fn decay_all(&self, target: f64, step: f64, now: DateTime<Utc>) -> Vec<DecayChange> {
        let mut users = self.users.write().await;
        let mut changes = Vec::new();
        for user in users.values_mut() {
            let old_score = user.score;
            let new_score = decay_toward(old_score, target, step);
            if new_score == old_score {
                continue;
            }
            user.score = new_score;
            user.decay_last_applied = Some(now);
            user.updated_at = now;
            user.refresh(now);
            changes.push(DecayChange {
                user_id: user.user_id.clone(),
                old_score,
                new_score,
                tier: user.tier,
            });
        }
        changes
    }

    pub async fn all(&self) -> Vec<UserReputation> {
        self.users.read().await.values().cloned().collect()
    }

    pub async fn restore(&self, users: Vec<UserReputation>) -> usize {
        let mut table = self.users.write().await;
        let count = users.len();
        for user in users {
            table.insert(user.user_id.clone(), user);
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// One decay step from `score` toward `target` without overshooting
pub fn decay_toward(score: f64, target: f64, step: f64) -> f64 {
    let distance = target - score;
    if distance.abs() <= step {
        target
    } else {
        score + step.copysign(distance)
    }
}
