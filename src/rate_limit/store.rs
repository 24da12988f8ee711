//! Limit Store
//!
//! Persistence seam for counters, violations and decision metrics.
//! [`LimitStore`] implementations must make every increment a single
//! atomic upsert: the decision engine relies on the returned post-increment
//! count to admit exactly `limit` requests under concurrency.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::rules::{LimitType, Scope};
use crate::error::Result;

/// Key of a fixed-window request counter
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct BucketKey {
    pub rule_id: String,
    pub scope: Scope,
    pub scope_value: String,
    pub resource_type: Option<String>,
    pub window_start: DateTime<Utc>,
}

/// Request counter for one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub key: BucketKey,
    pub request_count: u64,
    pub window_end: DateTime<Utc>,
}

/// Key of a calendar-period usage counter
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct QuotaKey {
    pub system_id: String,
    pub rule_id: String,
    pub scope: Scope,
    pub scope_value: String,
    pub resource_type: Option<String>,
    pub period: LimitType,
    pub period_start: DateTime<Utc>,
}

/// Usage counter for one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quota {
    pub key: QuotaKey,
    pub quota_used: u64,
    pub quota_limit: u64,
    pub period_end: DateTime<Utc>,
}

impl Quota {
    /// Units left in the period
    pub fn remaining(&self) -> u64 {
        self.quota_limit.saturating_sub(self.quota_used)
    }

    /// Whether `at` falls inside the period
    pub fn is_current(&self, at: DateTime<Utc>) -> bool {
        self.key.period_start <= at && at < self.period_end
    }
}

/// Selects the current-period quotas of one identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaSelector {
    pub system_id: String,
    pub scope: Scope,
    pub scope_value: String,
    pub resource_type: Option<String>,
}

impl QuotaSelector {
    pub fn matches(&self, key: &QuotaKey) -> bool {
        key.system_id == self.system_id
            && key.scope == self.scope
            && key.scope_value == self.scope_value
            && key.resource_type == self.resource_type
    }
}

/// Immutable record of an exceeded rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub id: String,
    pub system_id: String,
    pub rule_id: String,
    pub scope: Scope,
    pub scope_value: String,
    pub resource_type: Option<String>,
    pub violated_limit: u32,
    pub actual_count: u64,
    pub violation_time: DateTime<Utc>,
    pub blocked: bool,
    pub severity: u8,
}

/// One row per admission decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub system_id: String,
    pub scope: Scope,
    pub scope_value: String,
    pub resource_type: Option<String>,
    pub rule_id: Option<String>,
    pub allowed: bool,
    pub timestamp: DateTime<Utc>,
}

/// Row counts per table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub buckets: usize,
    pub quotas: usize,
    pub violations: usize,
    pub metrics: usize,
}

/// Storage backend for the decision engine
#[async_trait]
pub trait LimitStore: Send + Sync + Debug {
    /// Add `amount` to a window counter, creating it if needed; returns the new state
    async fn increment_bucket(
        &self,
        key: &BucketKey,
        window_end: DateTime<Utc>,
        amount: u64,
    ) -> Result<Bucket>;

    /// Read a window counter
    async fn get_bucket(&self, key: &BucketKey) -> Result<Option<Bucket>>;

    /// Add `amount` to a period counter, creating it with `limit` if needed
    async fn increment_quota(
        &self,
        key: &QuotaKey,
        limit: u64,
        period_end: DateTime<Utc>,
        amount: u64,
    ) -> Result<Quota>;

    /// Read a period counter
    async fn get_quota(&self, key: &QuotaKey) -> Result<Option<Quota>>;

    /// Current-period quotas of an identity across resource types
    async fn current_quotas(
        &self,
        system_id: &str,
        scope: Scope,
        scope_value: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<Quota>>;

    async fn record_violation(&self, violation: Violation) -> Result<()>;

    /// Violations of a system at or after `since`, newest first
    async fn violations_since(&self, system_id: &str, since: DateTime<Utc>) -> Result<Vec<Violation>>;

    async fn record_metric(&self, metric: MetricRecord) -> Result<()>;

    /// Decision metrics of a system at or after `since`, oldest first
    async fn metrics_since(&self, system_id: &str, since: DateTime<Utc>) -> Result<Vec<MetricRecord>>;

    /// Delete buckets whose window ended before `before`
    async fn delete_buckets_before(&self, before: DateTime<Utc>) -> Result<usize>;

    /// Delete quotas whose period ended before `before`
    async fn delete_quotas_before(&self, before: DateTime<Utc>) -> Result<usize>;

    async fn delete_violations_before(&self, before: DateTime<Utc>) -> Result<usize>;

    async fn delete_metrics_before(&self, before: DateTime<Utc>) -> Result<usize>;

    async fn stats(&self) -> Result<StoreStats>;
}

/// In-memory limit store
#[derive(Debug, Clone, Default)]
pub struct MemoryLimitStore {
    buckets: Arc<RwLock<HashMap<BucketKey, Bucket>>>,
    quotas: Arc<RwLock<HashMap<QuotaKey, Quota>>>,
    violations: Arc<RwLock<Vec<Violation>>>,
    metrics: Arc<RwLock<Vec<MetricRecord>>>,
}

impl MemoryLimitStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LimitStore for MemoryLimitStore {
    async fn increment_bucket(
        &self,
        key: &BucketKey,
        window_end: DateTime<Utc>,
        amount: u64,
    ) -> Result<Bucket> {
        let mut buckets = self.buckets.write().await;
        let bucket = buckets.entry(key.clone()).or_insert_with(|| Bucket {
            key: key.clone(),
            request_count: 0,
            window_end,
        });
        bucket.request_count = bucket.request_count.saturating_add(amount);
        Ok(bucket.clone())
    }

    async fn get_bucket(&self, key: &BucketKey) -> Result<Option<Bucket>> {
        Ok(self.buckets.read().await.get(key).cloned())
    }

    async fn increment_quota(
        &self,
        key: &QuotaKey,
        limit: u64,
        period_end: DateTime<Utc>,
        amount: u64,
    ) -> Result<Quota> {
        let mut quotas = self.quotas.write().await;
        let quota = quotas.entry(key.clone()).or_insert_with(|| Quota {
            key: key.clone(),
            quota_used: 0,
            quota_limit: limit,
            period_end,
        });
        quota.quota_limit = limit;
        quota.quota_used = quota.quota_used.saturating_add(amount);
        Ok(quota.clone())
    }

    async fn get_quota(&self, key: &QuotaKey) -> Result<Option<Quota>> {
        Ok(self.quotas.read().await.get(key).cloned())
    }

    async fn current_quotas(
        &self,
        system_id: &str,
        scope: Scope,
        scope_value: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<Quota>> {
        let quotas = self.quotas.read().await;
        let mut found: Vec<Quota> = quotas
            .values()
            .filter(|q| {
                q.key.system_id == system_id
                    && q.key.scope == scope
                    && q.key.scope_value == scope_value
                    && q.is_current(at)
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| a.period_end.cmp(&b.period_end));
        Ok(found)
    }

    async fn record_violation(&self, violation: Violation) -> Result<()> {
        self.violations.write().await.push(violation);
        Ok(())
    }

    async fn violations_since(&self, system_id: &str, since: DateTime<Utc>) -> Result<Vec<Violation>> {
        let violations = self.violations.read().await;
        let mut found: Vec<Violation> = violations
            .iter()
            .filter(|v| v.system_id == system_id && v.violation_time >= since)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.violation_time.cmp(&a.violation_time));
        Ok(found)
    }

    async fn record_metric(&self, metric: MetricRecord) -> Result<()> {
        self.metrics.write().await.push(metric);
        Ok(())
    }

    async fn metrics_since(&self, system_id: &str, since: DateTime<Utc>) -> Result<Vec<MetricRecord>> {
        let metrics = self.metrics.read().await;
        Ok(metrics
            .iter()
            .filter(|m| m.system_id == system_id && m.timestamp >= since)
            .cloned()
            .collect())
    }

    async fn delete_buckets_before(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut buckets = self.buckets.write().await;
        let count = buckets.len();
        buckets.retain(|_, b| b.window_end >= before);
        Ok(count - buckets.len())
    }

    async fn delete_quotas_before(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut quotas = self.quotas.write().await;
        let count = quotas.len();
        quotas.retain(|_, q| q.period_end >= before);
        Ok(count - quotas.len())
    }

    async fn delete_violations_before(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut violations = self.violations.write().await;
        let count = violations.len();
        violations.retain(|v| v.violation_time >= before);
        Ok(count - violations.len())
    }

    async fn delete_metrics_before(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut metrics = self.metrics.write().await;
        let count = metrics.len();
        metrics.retain(|m| m.timestamp >= before);
        Ok(count - metrics.len())
    }

    async fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            buckets: self.buckets.read().await.len(),
            quotas: self.quotas.read().await.len(),
            violations: self.violations.read().await.len(),
            metrics: self.metrics.read().await.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn bucket_key(start: DateTime<Utc>) -> BucketKey {
        BucketKey {
            rule_id: "r1".into(),
            scope: Scope::Ip,
            scope_value: "10.0.0.1".into(),
            resource_type: None,
            window_start: start,
        }
    }

    fn quota_key(resource: Option<&str>) -> QuotaKey {
        QuotaKey {
            system_id: "sys".into(),
            rule_id: "r2".into(),
            scope: Scope::User,
            scope_value: "alice".into(),
            resource_type: resource.map(str::to_string),
            period: LimitType::Daily,
            period_start: t0(),
        }
    }

    #[tokio::test]
    async fn test_increment_bucket_creates_lazily() {
        let store = MemoryLimitStore::new();
        let key = bucket_key(t0());
        assert!(store.get_bucket(&key).await.unwrap().is_none());

        let first = store.increment_bucket(&key, t0() + Duration::seconds(1), 1).await.unwrap();
        assert_eq!(first.request_count, 1);
        let second = store.increment_bucket(&key, t0() + Duration::seconds(1), 1).await.unwrap();
        assert_eq!(second.request_count, 2);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_exact() {
        let store = Arc::new(MemoryLimitStore::new());
        let key = bucket_key(t0());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store.increment_bucket(&key, t0(), 1).await.unwrap().request_count
            }));
        }
        let mut counts: Vec<u64> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        counts.sort_unstable();
        assert_eq!(counts, (1..=50).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_quota_selector_and_current_period() {
        let store = MemoryLimitStore::new();
        let end = t0() + Duration::days(1);
        store.increment_quota(&quota_key(Some("upload")), 10, end, 3).await.unwrap();
        store.increment_quota(&quota_key(None), 10, end, 1).await.unwrap();

        let quota = store.get_quota(&quota_key(Some("upload"))).await.unwrap().unwrap();
        assert_eq!(quota.quota_used, 3);
        assert_eq!(quota.remaining(), 7);

        let current = store
            .current_quotas("sys", Scope::User, "alice", t0())
            .await
            .unwrap();
        assert_eq!(current.len(), 2);

        // Outside the period nothing is current
        let current = store.current_quotas("sys", Scope::User, "alice", end).await.unwrap();
        assert!(current.is_empty());

        let selector = QuotaSelector {
            system_id: "sys".into(),
            scope: Scope::User,
            scope_value: "alice".into(),
            resource_type: Some("upload".into()),
        };
        assert!(selector.matches(&quota.key));
    }

    #[tokio::test]
    async fn test_cleanup_respects_cutoff() {
        let store = MemoryLimitStore::new();
        store.increment_bucket(&bucket_key(t0()), t0() + Duration::seconds(1), 1).await.unwrap();
        store
            .increment_bucket(&bucket_key(t0() + Duration::hours(2)), t0() + Duration::hours(2), 1)
            .await
            .unwrap();

        let removed = store.delete_buckets_before(t0() + Duration::hours(1)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.stats().await.unwrap().buckets, 1);
    }

    #[tokio::test]
    async fn test_violations_newest_first() {
        let store = MemoryLimitStore::new();
        for i in 0..3 {
            store
                .record_violation(Violation {
                    id: format!("v{}", i),
                    system_id: "sys".into(),
                    rule_id: "r1".into(),
                    scope: Scope::Ip,
                    scope_value: "10.0.0.1".into(),
                    resource_type: None,
                    violated_limit: 5,
                    actual_count: 6,
                    violation_time: t0() + Duration::minutes(i),
                    blocked: true,
                    severity: 2,
                })
                .await
                .unwrap();
        }

        let found = store
            .violations_since("sys", t0() + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, "v2");

        let removed = store.delete_violations_before(t0() + Duration::minutes(2)).await.unwrap();
        assert_eq!(removed, 2);
    }
}
