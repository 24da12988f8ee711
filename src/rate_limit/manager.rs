//! Rate Limit Manager
//!
//! The decision engine. Evaluates every matching rule for a request, in
//! priority order, against fixed-window buckets and calendar-period quotas,
//! and stops at the first rule whose post-increment count exceeds its limit.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::bucket::BucketAccountant;
use super::config::RateLimitConfig;
use super::decision::{final_limit, Decision, LimitCheckRequest};
use super::quota::QuotaTracker;
use super::rules::{LimitType, NewRule, Rule, RuleStore, RuleUpdate, Scope};
use super::store::{LimitStore, MemoryLimitStore, MetricRecord, Quota, QuotaSelector, StoreStats, Violation};
use crate::clock::{self, SharedClock};
use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::lifecycle::BackgroundTask;
use crate::metrics::{
    CHECK_DURATION_SECONDS, CHECK_ERRORS_TOTAL, CLEANUP_ROWS_TOTAL, DECISIONS_TOTAL, VIOLATIONS_TOTAL,
};
use crate::reputation::ReputationManager;
use crate::throttle::AutoThrottler;

/// Usage of one rule for an identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleUsage {
    pub rule_id: String,
    pub rule_name: String,
    pub limit_type: LimitType,
    pub limit: u32,
    pub used: u64,
    pub remaining: u64,
    pub reset_time: DateTime<Utc>,
}

/// Violation counts of a system
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViolationStats {
    pub total: usize,
    pub last_24h: usize,
    pub by_scope: BTreeMap<String, usize>,
    pub by_rule: BTreeMap<String, usize>,
}

/// Rows removed by one retention pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub buckets: usize,
    pub quotas: usize,
    pub violations: usize,
    pub metrics: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.buckets + self.quotas + self.violations + self.metrics
    }
}

/// Severity of a violation by the kind of resource that was hammered
fn violation_severity(resource_type: Option<&str>) -> u8 {
    match resource_type {
        Some("login") | Some("auth") => 3,
        Some("api_call") | None => 1,
        Some(_) => 2,
    }
}

/// Seconds until `reset`, padded by the clock tolerance and at least 1
fn retry_after(reset: DateTime<Utc>, now: DateTime<Utc>, tolerance_secs: u64) -> u64 {
    let millis = (reset - now).num_milliseconds() + tolerance_secs as i64 * 1000;
    let secs = (millis + 999).div_euclid(1000);
    secs.max(1) as u64
}

fn validate_request(req: &LimitCheckRequest) -> Result<()> {
    if req.system_id.trim().is_empty() {
        return Err(Error::Validation("system_id must not be empty".to_string()));
    }
    if req.scope_value.trim().is_empty() {
        return Err(Error::Validation("scope_value must not be empty".to_string()));
    }
    Ok(())
}

/// Builder for [`RateLimitManager`]
pub struct RateLimitManagerBuilder {
    config: RateLimitConfig,
    store: Option<Arc<dyn LimitStore>>,
    clock: Option<SharedClock>,
    reputation: Option<Arc<ReputationManager>>,
    throttler: Option<Arc<AutoThrottler>>,
}

impl RateLimitManagerBuilder {
    pub fn store(mut self, store: Arc<dyn LimitStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Feed violations and clean requests of user-scoped checks into reputation
    pub fn reputation(mut self, reputation: Arc<ReputationManager>) -> Self {
        self.reputation = Some(reputation);
        self
    }

    pub fn throttler(mut self, throttler: Arc<AutoThrottler>) -> Self {
        self.throttler = Some(throttler);
        self
    }

    /// Build the manager and start the retention job
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Arc<RateLimitManager>> {
        self.config.validate().map_err(Error::Validation)?;

        let clock = self.clock.unwrap_or_else(clock::system);
        let store: Arc<dyn LimitStore> = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryLimitStore::new()));
        let rules = RuleStore::new(
            self.config.rule_cache_ttl(),
            self.config.rule_cache_size,
            clock.clone(),
        );
        let cleanup_interval = self.config.cleanup_interval();
        let run_cleanup = self.config.enabled && self.config.bucket_cleanup_interval_secs > 0;

        Ok(Arc::new_cyclic(|weak: &Weak<RateLimitManager>| {
            let cleanup_task = run_cleanup.then(|| {
                let weak = weak.clone();
                BackgroundTask::spawn("rate-limit-cleanup", cleanup_interval, move || {
                    let weak = weak.clone();
                    async move {
                        if let Some(manager) = weak.upgrade() {
                            if let Err(e) = manager.run_cleanup().await {
                                warn!("Rate limit cleanup failed: {}", e);
                            }
                        }
                    }
                })
            });

            RateLimitManager {
                config: Arc::new(RwLock::new(self.config)),
                rules,
                buckets: BucketAccountant::new(store.clone()),
                quotas: QuotaTracker::new(store.clone()),
                store,
                reputation: self.reputation,
                throttler: self.throttler,
                clock,
                cleanup_task,
            }
        }))
    }
}

/// Rule-based admission decisions over buckets and quotas
pub struct RateLimitManager {
    config: Arc<RwLock<RateLimitConfig>>,
    rules: RuleStore,
    store: Arc<dyn LimitStore>,
    buckets: BucketAccountant,
    quotas: QuotaTracker,
    reputation: Option<Arc<ReputationManager>>,
    throttler: Option<Arc<AutoThrottler>>,
    clock: SharedClock,
    cleanup_task: Option<BackgroundTask>,
}

impl std::fmt::Debug for RateLimitManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitManager")
            .field("store", &self.store)
            .field("reputation", &self.reputation.is_some())
            .field("throttler", &self.throttler.is_some())
            .finish_non_exhaustive()
    }
}

impl RateLimitManager {
    pub fn builder(config: RateLimitConfig) -> RateLimitManagerBuilder {
        RateLimitManagerBuilder {
            config,
            store: None,
            clock: None,
            reputation: None,
            throttler: None,
        }
    }

    /// Decide whether a request may proceed
    ///
    /// Counters of rules evaluated before a denying rule keep their
    /// increment. A cancelled `ctx` is honored before any counter is touched
    /// and between rules.
    pub async fn check_limit(&self, ctx: &RequestContext, req: &LimitCheckRequest) -> Result<Decision> {
        let started = Instant::now();
        let result = self.evaluate(ctx, req).await;
        CHECK_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());

        match &result {
            Ok(decision) => {
                let outcome = if decision.allowed { "allowed" } else { "denied" };
                DECISIONS_TOTAL.with_label_values(&[outcome]).inc();
            }
            Err(e) => CHECK_ERRORS_TOTAL.with_label_values(&[e.kind()]).inc(),
        }
        result
    }

    /// [`check_limit`](Self::check_limit) with the configured failure policy applied
    pub async fn admit(&self, ctx: &RequestContext, req: &LimitCheckRequest) -> Decision {
        match self.check_limit(ctx, req).await {
            Ok(decision) => decision,
            Err(e) => {
                let config = self.config.read().await;
                let reason = format!("Rate limit check failed: {}", e);
                if config.fail_open {
                    warn!("{} (failing open)", reason);
                    Decision::fail_open(&reason)
                } else {
                    warn!("{} (failing closed)", reason);
                    Decision::fail_closed(config.default_retry_after_secs, &reason)
                }
            }
        }
    }

    async fn evaluate(&self, ctx: &RequestContext, req: &LimitCheckRequest) -> Result<Decision> {
        let config = self.config.read().await.clone();
        if !config.enabled {
            return Ok(Decision {
                reason: "Rate limiting disabled".to_string(),
                ..Decision::unlimited()
            });
        }
        validate_request(req)?;
        ctx.check()?;

        let resource_type = req.resource_type.as_deref();
        let rules = self.rules.rules_for_check(&req.system_id).await;
        let matching: Vec<&Rule> = rules
            .iter()
            .filter(|rule| rule.matches(req.scope, &req.scope_value, resource_type))
            .collect();

        let now = self.clock.now();
        if matching.is_empty() {
            self.record_metric(&config, req, None, true, now).await;
            return Ok(Decision::unlimited());
        }

        let (rep_multiplier, throttle_multiplier) = if config.apply_adaptive_limits {
            self.adaptive_multipliers(req).await
        } else {
            (1.0, 1.0)
        };

        // (remaining, limit) of the most restrictive rule, earliest reset
        let mut tightest: Option<(u64, u32)> = None;
        let mut earliest_reset: Option<DateTime<Utc>> = None;

        for rule in matching {
            ctx.check()?;

            let limit = if config.apply_adaptive_limits {
                final_limit(rule.limit_value, rep_multiplier, throttle_multiplier).max(1)
            } else {
                rule.limit_value
            };

            let (count, reset) = if rule.limit_type.is_period() {
                let quota = self
                    .quotas
                    .hit(rule, &req.system_id, &req.scope_value, resource_type, 1, now)
                    .await?;
                (quota.quota_used, quota.period_end)
            } else {
                let usage = self.buckets.hit(rule, &req.scope_value, resource_type, now).await?;
                (usage.count, usage.window_end)
            };

            if count > limit as u64 {
                return Ok(self.deny(&config, req, rule, limit, count, reset, now).await);
            }

            let remaining = limit as u64 - count;
            if tightest.map_or(true, |(r, l)| remaining < r || (remaining == r && limit < l)) {
                tightest = Some((remaining, limit));
            }
            if earliest_reset.map_or(true, |r| reset < r) {
                earliest_reset = Some(reset);
            }
        }

        if req.scope == Scope::User {
            if let Some(reputation) = &self.reputation {
                if let Err(e) = reputation.record_clean_request(&req.scope_value).await {
                    warn!("Failed to record clean request for {}: {}", req.scope_value, e);
                }
            }
        }
        self.record_metric(&config, req, None, true, now).await;

        let (remaining, limit) = tightest.unwrap_or((0, 0));
        Ok(Decision {
            allowed: true,
            rule_id: None,
            reason: "Within limits".to_string(),
            retry_after_seconds: 0,
            limit,
            remaining: remaining.min(u32::MAX as u64) as u32,
            reset_time: earliest_reset,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn deny(
        &self,
        config: &RateLimitConfig,
        req: &LimitCheckRequest,
        rule: &Rule,
        limit: u32,
        count: u64,
        reset: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Decision {
        let severity = violation_severity(req.resource_type.as_deref());
        let reason = format!("Rate limit exceeded: {} ({}/{})", rule.limit_type, count, limit);

        VIOLATIONS_TOTAL
            .with_label_values(&[req.scope.as_str(), rule.limit_type.as_str()])
            .inc();

        if config.enable_violation_tracking {
            let violation = Violation {
                id: Uuid::new_v4().to_string(),
                system_id: req.system_id.clone(),
                rule_id: rule.id.clone(),
                scope: req.scope,
                scope_value: req.scope_value.clone(),
                resource_type: req.resource_type.clone(),
                violated_limit: limit,
                actual_count: count,
                violation_time: now,
                blocked: true,
                severity,
            };
            if let Err(e) = self.store.record_violation(violation).await {
                warn!("Failed to record violation of rule {}: {}", rule.id, e);
            }
        }

        if req.scope == Scope::User {
            if let Some(reputation) = &self.reputation {
                if let Err(e) = reputation
                    .record_violation(&req.scope_value, severity, &reason)
                    .await
                {
                    warn!("Failed to record reputation violation for {}: {}", req.scope_value, e);
                }
            }
        }

        self.record_metric(config, req, Some(&rule.id), false, now).await;
        debug!(
            "Denied {} {} on rule {} ({}/{})",
            req.scope, req.scope_value, rule.id, count, limit
        );

        Decision {
            allowed: false,
            rule_id: Some(rule.id.clone()),
            reason,
            retry_after_seconds: retry_after(reset, now, config.clock_tolerance_secs),
            limit,
            remaining: 0,
            reset_time: Some(reset),
        }
    }

    async fn adaptive_multipliers(&self, req: &LimitCheckRequest) -> (f64, f64) {
        let throttle = self
            .throttler
            .as_ref()
            .map_or(1.0, |t| t.get_throttle_multiplier());

        let reputation = match (&self.reputation, req.scope) {
            (Some(reputation), Scope::User) => match reputation.get_multiplier(&req.scope_value).await {
                Ok(m) => m,
                Err(e) => {
                    warn!("Reputation lookup failed for {}: {}", req.scope_value, e);
                    1.0
                }
            },
            _ => 1.0,
        };

        (reputation, throttle)
    }

    async fn record_metric(
        &self,
        config: &RateLimitConfig,
        req: &LimitCheckRequest,
        rule_id: Option<&str>,
        allowed: bool,
        now: DateTime<Utc>,
    ) {
        if !config.enable_metrics {
            return;
        }
        let record = MetricRecord {
            system_id: req.system_id.clone(),
            scope: req.scope,
            scope_value: req.scope_value.clone(),
            resource_type: req.resource_type.clone(),
            rule_id: rule_id.map(str::to_string),
            allowed,
            timestamp: now,
        };
        if let Err(e) = self.store.record_metric(record).await {
            warn!("Failed to record decision metric: {}", e);
        }
    }

    // Rules

    pub async fn create_rule(&self, rule: NewRule) -> Result<Rule> {
        self.rules.create(rule).await
    }

    pub async fn update_rule(&self, rule_id: &str, update: RuleUpdate) -> Result<Rule> {
        self.rules.update(rule_id, update).await
    }

    /// Delete a rule; returns false if it did not exist
    pub async fn delete_rule(&self, rule_id: &str) -> Result<bool> {
        self.rules.delete(rule_id).await
    }

    pub async fn get_rule(&self, rule_id: &str) -> Option<Rule> {
        self.rules.get(rule_id).await
    }

    /// All rules of a system in priority order
    pub async fn get_rules(&self, system_id: &str) -> Vec<Rule> {
        self.rules.list(system_id).await
    }

    pub async fn rule_count(&self) -> usize {
        self.rules.count().await
    }

    // Usage and quotas

    /// Current usage of every rule that applies to an identity, without counting
    pub async fn get_usage(
        &self,
        system_id: &str,
        scope: Scope,
        scope_value: &str,
        resource_type: Option<&str>,
    ) -> Result<Vec<RuleUsage>> {
        let now = self.clock.now();
        let rules = self.rules.rules_for_check(system_id).await;
        let mut usage = Vec::new();

        for rule in rules.iter().filter(|r| r.matches(scope, scope_value, resource_type)) {
            let (used, reset_time) = if rule.limit_type.is_period() {
                match self
                    .quotas
                    .peek(rule, system_id, scope_value, resource_type, now)
                    .await?
                {
                    Some(quota) => (quota.quota_used, quota.period_end),
                    None => (0, super::quota::period_bounds(rule.limit_type, now)?.1),
                }
            } else {
                let window = self.buckets.peek(rule, scope_value, resource_type, now).await?;
                (window.count, window.window_end)
            };

            usage.push(RuleUsage {
                rule_id: rule.id.clone(),
                rule_name: rule.rule_name.clone(),
                limit_type: rule.limit_type,
                limit: rule.limit_value,
                used,
                remaining: (rule.limit_value as u64).saturating_sub(used),
                reset_time,
            });
        }

        Ok(usage)
    }

    /// Charge `amount` units against every period rule that applies
    ///
    /// Used for work whose cost is known only after admission. Returns the
    /// quotas after charging.
    pub async fn increment_quota(
        &self,
        system_id: &str,
        scope: Scope,
        scope_value: &str,
        resource_type: Option<&str>,
        amount: u64,
    ) -> Result<Vec<Quota>> {
        if amount == 0 {
            return Err(Error::Validation("amount must be positive".to_string()));
        }
        let now = self.clock.now();
        let rules = self.rules.rules_for_check(system_id).await;
        let mut charged = Vec::new();

        for rule in rules
            .iter()
            .filter(|r| r.limit_type.is_period() && r.matches(scope, scope_value, resource_type))
        {
            charged.push(
                self.quotas
                    .hit(rule, system_id, scope_value, resource_type, amount, now)
                    .await?,
            );
        }
        Ok(charged)
    }

    /// The current-period quota of an identity that resets first
    pub async fn get_quota(
        &self,
        system_id: &str,
        scope: Scope,
        scope_value: &str,
        resource_type: Option<&str>,
    ) -> Result<Option<Quota>> {
        let selector = QuotaSelector {
            system_id: system_id.to_string(),
            scope,
            scope_value: scope_value.to_string(),
            resource_type: resource_type.map(str::to_string),
        };
        self.quotas.current(&selector, self.clock.now()).await
    }

    // Violations

    pub async fn get_violations(&self, system_id: &str, since: DateTime<Utc>) -> Result<Vec<Violation>> {
        self.store.violations_since(system_id, since).await
    }

    /// Violation counts over the retention window
    pub async fn get_violation_stats(&self, system_id: &str) -> Result<ViolationStats> {
        let now = self.clock.now();
        let retention = self.config.read().await.violation_retention();
        let since = now - ChronoDuration::from_std(retention).unwrap_or(ChronoDuration::days(7));
        let day_ago = now - ChronoDuration::hours(24);

        let violations = self.store.violations_since(system_id, since).await?;
        let mut stats = ViolationStats {
            total: violations.len(),
            ..Default::default()
        };
        for v in &violations {
            if v.violation_time >= day_ago {
                stats.last_24h += 1;
            }
            *stats.by_scope.entry(v.scope.to_string()).or_default() += 1;
            *stats.by_rule.entry(v.rule_id.clone()).or_default() += 1;
        }
        Ok(stats)
    }

    /// Decision metrics of a system at or after `since`
    pub async fn get_metrics(&self, system_id: &str, since: DateTime<Utc>) -> Result<Vec<MetricRecord>> {
        self.store.metrics_since(system_id, since).await
    }

    pub async fn store_stats(&self) -> Result<StoreStats> {
        self.store.stats().await
    }

    // Retention

    pub async fn cleanup_old_buckets(&self, before: DateTime<Utc>) -> Result<usize> {
        let removed = self.buckets.cleanup(before).await?;
        CLEANUP_ROWS_TOTAL.with_label_values(&["buckets"]).inc_by(removed as u64);
        Ok(removed)
    }

    pub async fn cleanup_old_quotas(&self, before: DateTime<Utc>) -> Result<usize> {
        let removed = self.quotas.cleanup(before).await?;
        CLEANUP_ROWS_TOTAL.with_label_values(&["quotas"]).inc_by(removed as u64);
        Ok(removed)
    }

    pub async fn cleanup_old_violations(&self, before: DateTime<Utc>) -> Result<usize> {
        let removed = self.store.delete_violations_before(before).await?;
        CLEANUP_ROWS_TOTAL.with_label_values(&["violations"]).inc_by(removed as u64);
        Ok(removed)
    }

    pub async fn cleanup_old_metrics(&self, before: DateTime<Utc>) -> Result<usize> {
        let removed = self.store.delete_metrics_before(before).await?;
        CLEANUP_ROWS_TOTAL.with_label_values(&["metrics"]).inc_by(removed as u64);
        Ok(removed)
    }

    /// One retention pass with the configured cutoffs
    ///
    /// Buckets go once their window ended more than one cleanup interval
    /// ago; quotas and violations after the violation retention; metrics
    /// after the metrics retention.
    pub async fn run_cleanup(&self) -> Result<CleanupReport> {
        let (bucket_age, violation_age, metrics_age) = {
            let config = self.config.read().await;
            (
                config.cleanup_interval(),
                config.violation_retention(),
                config.metrics_retention(),
            )
        };
        let now = self.clock.now();
        let cutoff = |age: std::time::Duration| {
            now - ChronoDuration::from_std(age).unwrap_or(ChronoDuration::zero())
        };

        let report = CleanupReport {
            buckets: self.cleanup_old_buckets(cutoff(bucket_age)).await?,
            quotas: self.cleanup_old_quotas(cutoff(violation_age)).await?,
            violations: self.cleanup_old_violations(cutoff(violation_age)).await?,
            metrics: self.cleanup_old_metrics(cutoff(metrics_age)).await?,
        };

        let purged = self.rules.purge_cache();
        if purged > 0 {
            debug!("Purged {} expired rule cache entries", purged);
        }

        if report.total() > 0 {
            info!(
                "Rate limit cleanup removed {} buckets, {} quotas, {} violations, {} metrics",
                report.buckets, report.quotas, report.violations, report.metrics
            );
        }
        Ok(report)
    }

    // Configuration

    /// Replace the configuration; the retention schedule is fixed at build time
    pub async fn update_config(&self, config: RateLimitConfig) -> Result<()> {
        config.validate().map_err(Error::Validation)?;
        *self.config.write().await = config;
        Ok(())
    }

    pub async fn get_config(&self) -> RateLimitConfig {
        self.config.read().await.clone()
    }

    pub fn reputation(&self) -> Option<&Arc<ReputationManager>> {
        self.reputation.as_ref()
    }

    pub fn throttler(&self) -> Option<&Arc<AutoThrottler>> {
        self.throttler.as_ref()
    }

    /// Stop the retention job
    pub fn close(&self) {
        if let Some(task) = &self.cleanup_task {
            task.stop();
        }
    }
}

impl Drop for RateLimitManager {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::reputation::ReputationConfig;
    use crate::throttle::{FixedMonitor, ResourceSample, ThrottleConfig, ThrottleLevel};
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap()
    }

    fn test_config() -> RateLimitConfig {
        RateLimitConfig {
            bucket_cleanup_interval_secs: 0,
            ..RateLimitConfig::default()
        }
    }

    fn manager(clock: &ManualClock) -> Arc<RateLimitManager> {
        RateLimitManager::builder(test_config())
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap()
    }

    fn ip_request(ip: &str) -> LimitCheckRequest {
        LimitCheckRequest::new("api", Scope::Ip, ip)
    }

    #[test]
    fn test_retry_after_rounds_up_with_tolerance() {
        let now = start();
        assert_eq!(retry_after(now + ChronoDuration::milliseconds(200), now, 1), 2);
        assert_eq!(retry_after(now + ChronoDuration::seconds(30), now, 0), 30);
        assert_eq!(retry_after(now, now, 0), 1);
        assert_eq!(retry_after(now - ChronoDuration::seconds(5), now, 0), 1);
    }

    #[test]
    fn test_violation_severity() {
        assert_eq!(violation_severity(Some("login")), 3);
        assert_eq!(violation_severity(Some("api_call")), 1);
        assert_eq!(violation_severity(None), 1);
        assert_eq!(violation_severity(Some("upload")), 2);
    }

    #[tokio::test]
    async fn test_no_rules_is_unlimited() {
        let clock = ManualClock::new(start());
        let manager = manager(&clock);
        let decision = manager
            .check_limit(&RequestContext::background(), &ip_request("10.0.0.1"))
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.limit, 0);
        assert_eq!(decision.reason, "No matching rules");
    }

    #[tokio::test]
    async fn test_per_second_limit_denies_sixth_request() {
        let clock = ManualClock::new(start());
        let manager = manager(&clock);
        manager
            .create_rule(NewRule::new("api", Scope::Ip, LimitType::PerSecond, 5).scope_value("192.168.1.1"))
            .await
            .unwrap();

        let ctx = RequestContext::background();
        let req = ip_request("192.168.1.1");
        for expected_remaining in (0..5).rev() {
            let decision = manager.check_limit(&ctx, &req).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.limit, 5);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let denied = manager.check_limit(&ctx, &req).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reason, "Rate limit exceeded: per_second (6/5)");
        assert_eq!(denied.retry_after_seconds, 2);
        assert!(denied.rule_id.is_some());

        // A different address is unaffected
        assert!(manager.check_limit(&ctx, &ip_request("192.168.1.2")).await.unwrap().allowed);

        // The next window starts fresh
        clock.advance(ChronoDuration::seconds(1));
        assert!(manager.check_limit(&ctx, &req).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_violation_is_recorded() {
        let clock = ManualClock::new(start());
        let manager = manager(&clock);
        let rule = manager
            .create_rule(NewRule::new("api", Scope::Ip, LimitType::PerMinute, 1))
            .await
            .unwrap();

        let ctx = RequestContext::background();
        let req = ip_request("10.0.0.9").with_resource_type("upload");
        manager.check_limit(&ctx, &req).await.unwrap();
        manager.check_limit(&ctx, &req).await.unwrap();

        let violations = manager.get_violations("api", start()).await.unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule_id, rule.id);
        assert_eq!(violations[0].violated_limit, 1);
        assert_eq!(violations[0].actual_count, 2);
        assert_eq!(violations[0].severity, 2);

        let stats = manager.get_violation_stats("api").await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.by_scope.get("ip"), Some(&1));
    }

    #[tokio::test]
    async fn test_daily_quota_and_usage() {
        let clock = ManualClock::new(start());
        let manager = manager(&clock);
        manager
            .create_rule(NewRule::new("api", Scope::ApiKey, LimitType::Daily, 3).resource_type("export"))
            .await
            .unwrap();

        let ctx = RequestContext::background();
        let req = LimitCheckRequest::new("api", Scope::ApiKey, "key-1").with_resource_type("export");
        for _ in 0..3 {
            assert!(manager.check_limit(&ctx, &req).await.unwrap().allowed);
        }
        let denied = manager.check_limit(&ctx, &req).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(
            denied.reset_time,
            Some(Utc.with_ymd_and_hms(2024, 6, 4, 0, 0, 0).unwrap())
        );

        let usage = manager
            .get_usage("api", Scope::ApiKey, "key-1", Some("export"))
            .await
            .unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].used, 4);
        assert_eq!(usage[0].remaining, 0);

        // Next day is a new period
        clock.advance(ChronoDuration::days(1));
        assert!(manager.check_limit(&ctx, &req).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_increment_quota_charges_period_rules() {
        let clock = ManualClock::new(start());
        let manager = manager(&clock);
        manager
            .create_rule(NewRule::new("api", Scope::User, LimitType::Monthly, 100))
            .await
            .unwrap();
        manager
            .create_rule(NewRule::new("api", Scope::User, LimitType::PerSecond, 100))
            .await
            .unwrap();

        let charged = manager
            .increment_quota("api", Scope::User, "alice", None, 40)
            .await
            .unwrap();
        assert_eq!(charged.len(), 1);
        assert_eq!(charged[0].quota_used, 40);

        let quota = manager
            .get_quota("api", Scope::User, "alice", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(quota.remaining(), 60);

        assert!(manager
            .increment_quota("api", Scope::User, "alice", None, 0)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_most_restrictive_rule_sets_headers() {
        let clock = ManualClock::new(start());
        let manager = manager(&clock);
        manager
            .create_rule(NewRule::new("api", Scope::Ip, LimitType::PerMinute, 100).priority(1))
            .await
            .unwrap();
        manager
            .create_rule(NewRule::new("api", Scope::Ip, LimitType::PerSecond, 3).priority(2))
            .await
            .unwrap();

        let decision = manager
            .check_limit(&RequestContext::background(), &ip_request("10.1.1.1"))
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.limit, 3);
        assert_eq!(decision.remaining, 2);
        assert_eq!(decision.reset_time, Some(start() + ChronoDuration::seconds(1)));
    }

    #[tokio::test]
    async fn test_disabled_manager_allows_everything() {
        let manager = RateLimitManager::builder(RateLimitConfig::disabled()).build().unwrap();
        manager
            .create_rule(NewRule::new("api", Scope::Ip, LimitType::PerSecond, 1))
            .await
            .unwrap();
        for _ in 0..5 {
            let decision = manager
                .check_limit(&RequestContext::background(), &ip_request("10.0.0.1"))
                .await
                .unwrap();
            assert!(decision.allowed);
        }
    }

    #[tokio::test]
    async fn test_cancelled_context_counts_nothing() {
        let clock = ManualClock::new(start());
        let manager = manager(&clock);
        manager
            .create_rule(NewRule::new("api", Scope::Ip, LimitType::PerSecond, 1))
            .await
            .unwrap();

        let ctx = RequestContext::background();
        ctx.cancel();
        let result = manager.check_limit(&ctx, &ip_request("10.0.0.1")).await;
        assert!(matches!(result, Err(Error::Cancelled)));

        let decision = manager
            .check_limit(&RequestContext::background(), &ip_request("10.0.0.1"))
            .await
            .unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn test_admit_applies_failure_policy() {
        let clock = ManualClock::new(start());
        let manager = manager(&clock);
        let bad = LimitCheckRequest::new("api", Scope::Ip, "");

        let decision = manager.admit(&RequestContext::background(), &bad).await;
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_seconds, 60);

        let mut config = manager.get_config().await;
        config.fail_open = true;
        manager.update_config(config).await.unwrap();
        assert!(manager.admit(&RequestContext::background(), &bad).await.allowed);
    }

    #[tokio::test]
    async fn test_user_violations_lower_reputation() {
        let clock = ManualClock::new(start());
        let reputation = ReputationManager::builder(ReputationConfig {
            decay_interval_secs: 0,
            ..ReputationConfig::default()
        })
        .clock(Arc::new(clock.clone()))
        .build()
        .await
        .unwrap();
        let manager = RateLimitManager::builder(test_config())
            .clock(Arc::new(clock.clone()))
            .reputation(reputation.clone())
            .build()
            .unwrap();
        manager
            .create_rule(NewRule::new("api", Scope::User, LimitType::PerMinute, 1))
            .await
            .unwrap();

        let ctx = RequestContext::background();
        let req = LimitCheckRequest::new("api", Scope::User, "mallory").with_resource_type("login");
        manager.check_limit(&ctx, &req).await.unwrap();
        let denied = manager.check_limit(&ctx, &req).await.unwrap();
        assert!(!denied.allowed);

        let user = reputation.get_user_reputation("mallory").await.unwrap();
        assert!(user.score < 50.0);
        assert_eq!(user.violation_count, 1);
    }

    #[tokio::test]
    async fn test_adaptive_limits_follow_throttle() {
        let clock = ManualClock::new(start());
        let throttler = AutoThrottler::builder(ThrottleConfig {
            enabled: false,
            ..ThrottleConfig::default()
        })
        .monitor(Arc::new(FixedMonitor::new(ResourceSample::default())))
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
        throttler.manually_set_throttle(ThrottleLevel::Critical, "load test");

        let manager = RateLimitManager::builder(RateLimitConfig {
            apply_adaptive_limits: true,
            ..test_config()
        })
        .clock(Arc::new(clock.clone()))
        .throttler(throttler)
        .build()
        .unwrap();
        manager
            .create_rule(NewRule::new("api", Scope::Ip, LimitType::PerMinute, 10))
            .await
            .unwrap();

        let ctx = RequestContext::background();
        let req = ip_request("10.2.2.2");
        // 10 × 0.2 = 2
        assert_eq!(manager.check_limit(&ctx, &req).await.unwrap().limit, 2);
        assert!(manager.check_limit(&ctx, &req).await.unwrap().allowed);
        assert!(!manager.check_limit(&ctx, &req).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_run_cleanup_uses_retention() {
        let clock = ManualClock::new(start());
        let manager = manager(&clock);
        manager
            .create_rule(NewRule::new("api", Scope::Ip, LimitType::PerSecond, 1))
            .await
            .unwrap();
        let ctx = RequestContext::background();
        manager.check_limit(&ctx, &ip_request("10.0.0.1")).await.unwrap();
        manager.check_limit(&ctx, &ip_request("10.0.0.1")).await.unwrap();

        let stats = manager.store_stats().await.unwrap();
        assert_eq!(stats.buckets, 1);
        assert_eq!(stats.violations, 1);

        clock.advance(ChronoDuration::days(8));
        let report = manager.run_cleanup().await.unwrap();
        assert_eq!(report.buckets, 1);
        assert_eq!(report.violations, 1);
        assert_eq!(report.metrics, 0);

        let stats = manager.store_stats().await.unwrap();
        assert_eq!(stats.buckets, 0);
        assert_eq!(stats.metrics, 2);
    }
}
