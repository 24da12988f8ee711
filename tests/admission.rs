// End-to-end admission checks against the public API

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ratewarden::error::{Error, Result};
use ratewarden::rate_limit::store::{Bucket, BucketKey, MetricRecord, QuotaKey};
use ratewarden::rate_limit::{
    LimitCheckRequest, LimitStore, LimitType, MemoryLimitStore, NewRule, Quota, RateLimitConfig,
    RateLimitManager, RuleUpdate, Scope, StoreStats, Violation,
};
use ratewarden::reputation::{ReputationConfig, ReputationManager, VipTier};
use ratewarden::{ManualClock, RequestContext};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Memory store whose counters and violation log can be switched off
#[derive(Debug, Default)]
struct FlakyStore {
    inner: MemoryLimitStore,
    counters_down: AtomicBool,
    violations_down: AtomicBool,
}

impl FlakyStore {
    fn counters(&self) -> Result<()> {
        if self.counters_down.load(Ordering::SeqCst) {
            Err(Error::Store("counter table unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LimitStore for FlakyStore {
    async fn increment_bucket(&self, key: &BucketKey, window_end: DateTime<Utc>, amount: u64) -> Result<Bucket> {
        self.counters()?;
        self.inner.increment_bucket(key, window_end, amount).await
    }

    async fn get_bucket(&self, key: &BucketKey) -> Result<Option<Bucket>> {
        self.inner.get_bucket(key).await
    }

    async fn increment_quota(
        &self,
        key: &QuotaKey,
        limit: u64,
        period_end: DateTime<Utc>,
        amount: u64,
    ) -> Result<Quota> {
        self.counters()?;
        self.inner.increment_quota(key, limit, period_end, amount).await
    }

    async fn get_quota(&self, key: &QuotaKey) -> Result<Option<Quota>> {
        self.inner.get_quota(key).await
    }

    async fn current_quotas(
        &self,
        system_id: &str,
        scope: Scope,
        scope_value: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<Quota>> {
        self.inner.current_quotas(system_id, scope, scope_value, at).await
    }

    async fn record_violation(&self, violation: Violation) -> Result<()> {
        if self.violations_down.load(Ordering::SeqCst) {
            return Err(Error::Store("violation log unavailable".into()));
        }
        self.inner.record_violation(violation).await
    }

    async fn violations_since(&self, system_id: &str, since: DateTime<Utc>) -> Result<Vec<Violation>> {
        self.inner.violations_since(system_id, since).await
    }

    async fn record_metric(&self, metric: MetricRecord) -> Result<()> {
        self.inner.record_metric(metric).await
    }

    async fn metrics_since(&self, system_id: &str, since: DateTime<Utc>) -> Result<Vec<MetricRecord>> {
        self.inner.metrics_since(system_id, since).await
    }

    async fn delete_buckets_before(&self, before: DateTime<Utc>) -> Result<usize> {
        self.inner.delete_buckets_before(before).await
    }

    async fn delete_quotas_before(&self, before: DateTime<Utc>) -> Result<usize> {
        self.inner.delete_quotas_before(before).await
    }

    async fn delete_violations_before(&self, before: DateTime<Utc>) -> Result<usize> {
        self.inner.delete_violations_before(before).await
    }

    async fn delete_metrics_before(&self, before: DateTime<Utc>) -> Result<usize> {
        self.inner.delete_metrics_before(before).await
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.inner.stats().await
    }
}

fn config() -> RateLimitConfig {
    RateLimitConfig {
        bucket_cleanup_interval_secs: 0,
        ..RateLimitConfig::default()
    }
}

fn manager_with_store(config: RateLimitConfig, store: Arc<FlakyStore>) -> Arc<RateLimitManager> {
    RateLimitManager::builder(config).store(store).build().unwrap()
}

#[tokio::test]
async fn test_store_failure_fails_closed_by_default() {
    let store = Arc::new(FlakyStore::default());
    let manager = manager_with_store(config(), store.clone());
    manager
        .create_rule(NewRule::new("shop", Scope::Ip, LimitType::PerMinute, 100))
        .await
        .unwrap();
    store.counters_down.store(true, Ordering::SeqCst);

    let ctx = RequestContext::background();
    let req = LimitCheckRequest::new("shop", Scope::Ip, "10.0.0.1");

    let err = manager.check_limit(&ctx, &req).await.unwrap_err();
    assert_eq!(err.kind(), "store");

    let decision = manager.admit(&ctx, &req).await;
    assert!(!decision.allowed);
    assert_eq!(decision.retry_after_seconds, config().default_retry_after_secs);
    assert!(decision.reason.starts_with("Rate limit check failed"));
}

#[tokio::test]
async fn test_store_failure_fails_open_when_configured() {
    let store = Arc::new(FlakyStore::default());
    let manager = manager_with_store(
        RateLimitConfig {
            fail_open: true,
            ..config()
        },
        store.clone(),
    );
    manager
        .create_rule(NewRule::new("shop", Scope::Ip, LimitType::Daily, 1))
        .await
        .unwrap();
    store.counters_down.store(true, Ordering::SeqCst);

    let ctx = RequestContext::background();
    let req = LimitCheckRequest::new("shop", Scope::Ip, "10.0.0.1");
    for _ in 0..3 {
        assert!(manager.admit(&ctx, &req).await.allowed);
    }
}

#[tokio::test]
async fn test_violation_log_failure_still_denies() {
    let store = Arc::new(FlakyStore::default());
    let manager = manager_with_store(config(), store.clone());
    manager
        .create_rule(NewRule::new("shop", Scope::Session, LimitType::Daily, 1))
        .await
        .unwrap();
    store.violations_down.store(true, Ordering::SeqCst);

    let ctx = RequestContext::background();
    let req = LimitCheckRequest::new("shop", Scope::Session, "sess-1");
    assert!(manager.check_limit(&ctx, &req).await.unwrap().allowed);

    let denied = manager.check_limit(&ctx, &req).await.unwrap();
    assert!(!denied.allowed);
    assert!(manager.get_violations("shop", DateTime::<Utc>::MIN_UTC).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_checks_admit_exactly_the_limit() {
    let manager = RateLimitManager::builder(config()).build().unwrap();
    manager
        .create_rule(NewRule::new("shop", Scope::ApiKey, LimitType::Daily, 10))
        .await
        .unwrap();

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move {
                let req = LimitCheckRequest::new("shop", Scope::ApiKey, "key-1");
                manager
                    .check_limit(&RequestContext::background(), &req)
                    .await
                    .unwrap()
                    .allowed
            })
        })
        .collect();

    let results = futures::future::join_all(handles).await;
    let allowed = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
    assert_eq!(allowed, 10);
}

#[tokio::test]
async fn test_reputation_scales_user_limits() {
    let reputation = ReputationManager::builder(ReputationConfig {
        decay_interval_secs: 0,
        ..ReputationConfig::default()
    })
    .build()
    .await
    .unwrap();
    reputation.set_user_reputation("mallory", 10.0, "abuse report").await.unwrap();
    reputation
        .set_vip_tier("carol", VipTier::Premium, None, "paying customer")
        .await
        .unwrap();

    let manager = RateLimitManager::builder(RateLimitConfig {
        apply_adaptive_limits: true,
        ..config()
    })
    .reputation(reputation.clone())
    .build()
    .unwrap();
    manager
        .create_rule(NewRule::new("shop", Scope::User, LimitType::Daily, 10))
        .await
        .unwrap();

    let ctx = RequestContext::background();
    let check = |user: &str| LimitCheckRequest::new("shop", Scope::User, user);

    // 10 × 0.5
    assert_eq!(manager.check_limit(&ctx, &check("mallory")).await.unwrap().limit, 5);
    // 10 × 2.0
    assert_eq!(manager.check_limit(&ctx, &check("carol")).await.unwrap().limit, 20);
    // 10 × 1.0
    assert_eq!(manager.check_limit(&ctx, &check("dave")).await.unwrap().limit, 10);

    // Exhaust mallory's reduced quota; the denial lowers the score further
    for _ in 0..4 {
        assert!(manager.check_limit(&ctx, &check("mallory")).await.unwrap().allowed);
    }
    let before = reputation.get_user_reputation("mallory").await.unwrap();
    assert!(!manager.check_limit(&ctx, &check("mallory")).await.unwrap().allowed);
    let after = reputation.get_user_reputation("mallory").await.unwrap();
    assert!(after.score < before.score);
    assert_eq!(after.violation_count, before.violation_count + 1);

    reputation.close().await.unwrap();
}

#[tokio::test]
async fn test_usage_reports_every_rule() {
    let manager = RateLimitManager::builder(config()).build().unwrap();
    manager
        .create_rule(NewRule::new("shop", Scope::Ip, LimitType::Daily, 100))
        .await
        .unwrap();
    manager
        .create_rule(NewRule::new("shop", Scope::Ip, LimitType::Monthly, 1000))
        .await
        .unwrap();

    let ctx = RequestContext::background();
    let req = LimitCheckRequest::new("shop", Scope::Ip, "10.9.9.9");
    let decision = manager.check_limit(&ctx, &req).await.unwrap();
    assert!(decision.allowed);
    // The tighter rule drives the headers
    assert_eq!(decision.limit, 100);
    assert_eq!(decision.remaining, 99);

    let usage = manager.get_usage("shop", Scope::Ip, "10.9.9.9", None).await.unwrap();
    assert_eq!(usage.len(), 2);
    assert!(usage.iter().all(|u| u.used == 1));
}

fn manager_at_fixed_time() -> Arc<RateLimitManager> {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 6, 12, 0, 0).unwrap());
    RateLimitManager::builder(config())
        .clock(Arc::new(clock))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_scopes_are_counted_independently() {
    let manager = manager_at_fixed_time();
    for scope in [Scope::Ip, Scope::User, Scope::ApiKey] {
        manager
            .create_rule(NewRule::new("shop", scope, LimitType::PerMinute, 2))
            .await
            .unwrap();
    }

    let ctx = RequestContext::background();
    let by_ip = LimitCheckRequest::new("shop", Scope::Ip, "client-7");
    for _ in 0..2 {
        assert!(manager.check_limit(&ctx, &by_ip).await.unwrap().allowed);
    }
    assert!(!manager.check_limit(&ctx, &by_ip).await.unwrap().allowed);

    // Same identity string, other scopes: untouched counters
    for scope in [Scope::User, Scope::ApiKey] {
        let decision = manager
            .check_limit(&ctx, &LimitCheckRequest::new("shop", scope, "client-7"))
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
    }
}

#[tokio::test]
async fn test_resource_types_are_counted_independently() {
    let manager = manager_at_fixed_time();
    manager
        .create_rule(NewRule::new("shop", Scope::Ip, LimitType::PerMinute, 1).resource_type("login"))
        .await
        .unwrap();
    manager
        .create_rule(NewRule::new("shop", Scope::Ip, LimitType::PerMinute, 1).resource_type("upload"))
        .await
        .unwrap();

    let ctx = RequestContext::background();
    let login = LimitCheckRequest::new("shop", Scope::Ip, "10.0.0.9").with_resource_type("login");
    let upload = LimitCheckRequest::new("shop", Scope::Ip, "10.0.0.9").with_resource_type("upload");

    assert!(manager.check_limit(&ctx, &login).await.unwrap().allowed);
    assert!(!manager.check_limit(&ctx, &login).await.unwrap().allowed);
    assert!(manager.check_limit(&ctx, &upload).await.unwrap().allowed);

    // No rule filters on this resource, so nothing limits it
    let search = LimitCheckRequest::new("shop", Scope::Ip, "10.0.0.9").with_resource_type("search");
    for _ in 0..3 {
        assert!(manager.check_limit(&ctx, &search).await.unwrap().allowed);
    }
}

#[tokio::test]
async fn test_disabling_first_priority_hands_off_to_next_rule() {
    let manager = manager_at_fixed_time();
    let strict = manager
        .create_rule(NewRule::new("shop", Scope::Ip, LimitType::PerSecond, 1).priority(1))
        .await
        .unwrap();
    manager
        .create_rule(NewRule::new("shop", Scope::Ip, LimitType::PerMinute, 100).priority(2))
        .await
        .unwrap();

    let ctx = RequestContext::background();
    let req = LimitCheckRequest::new("shop", Scope::Ip, "10.2.2.2");
    assert!(manager.check_limit(&ctx, &req).await.unwrap().allowed);
    let denied = manager.check_limit(&ctx, &req).await.unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.rule_id.as_deref(), Some(strict.id.as_str()));

    manager
        .update_rule(
            &strict.id,
            RuleUpdate {
                enabled: Some(false),
                ..RuleUpdate::default()
            },
        )
        .await
        .unwrap();

    // Same second, but only the per-minute rule is left
    let decision = manager.check_limit(&ctx, &req).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.limit, 100);
}
