//! Admin Dashboard Support
//!
//! Snapshot of one system's admission state for an admin interface, and
//! the admin actions that adjust rules, reputation and throttling.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::config::RateLimitConfig;
use super::manager::{RateLimitManager, ViolationStats};
use super::rules::{NewRule, Rule, RuleUpdate};
use super::store::{StoreStats, Violation};
use crate::error::{Error, Result};
use crate::reputation::{RepStats, VipTier};
use crate::throttle::{SystemMetrics, ThrottleLevel};

/// Violations included in a dashboard snapshot
const RECENT_VIOLATIONS: usize = 50;

/// Dashboard data for admin interface
#[derive(Debug, Clone, Serialize)]
pub struct DashboardData {
    pub timestamp: DateTime<Utc>,
    pub system_id: String,
    pub rules: Vec<Rule>,
    pub store: StoreStats,
    pub violation_stats: ViolationStats,
    /// Newest first
    pub recent_violations: Vec<Violation>,
    /// Allowed share of decisions over the last hour, if any were recorded
    pub allow_rate_1h: Option<f64>,
    pub reputation: Option<RepStats>,
    pub throttle: Option<SystemMetrics>,
    pub config: RateLimitConfig,
}

/// Builds [`DashboardData`] for one system
pub struct DashboardBuilder<'a> {
    manager: &'a RateLimitManager,
    system_id: String,
}

impl<'a> DashboardBuilder<'a> {
    pub fn new(manager: &'a RateLimitManager, system_id: &str) -> Self {
        Self {
            manager,
            system_id: system_id.to_string(),
        }
    }

    pub async fn build(&self) -> Result<DashboardData> {
        let now = Utc::now();
        let manager = self.manager;

        let violation_stats = manager.get_violation_stats(&self.system_id).await?;
        let mut recent_violations = manager
            .get_violations(&self.system_id, now - Duration::hours(24))
            .await?;
        recent_violations.truncate(RECENT_VIOLATIONS);

        let metrics = manager.get_metrics(&self.system_id, now - Duration::hours(1)).await?;
        let allow_rate_1h = (!metrics.is_empty()).then(|| {
            metrics.iter().filter(|m| m.allowed).count() as f64 / metrics.len() as f64
        });

        let reputation = match manager.reputation() {
            Some(reputation) => Some(reputation.get_rep_stats().await),
            None => None,
        };

        Ok(DashboardData {
            timestamp: now,
            system_id: self.system_id.clone(),
            rules: manager.get_rules(&self.system_id).await,
            store: manager.store_stats().await?,
            violation_stats,
            recent_violations,
            allow_rate_1h,
            reputation,
            throttle: manager.throttler().map(|t| t.get_system_metrics()),
            config: manager.get_config().await,
        })
    }
}

/// Admin action for adjusting admission behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AdminAction {
    CreateRule { rule: NewRule },
    UpdateRule { rule_id: String, update: RuleUpdate },
    DeleteRule { rule_id: String },
    SetUserReputation { user_id: String, score: f64, reason: String },
    SetVipTier {
        user_id: String,
        vip_tier: VipTier,
        expires_at: Option<DateTime<Utc>>,
        reason: String,
    },
    RemoveVipTier { user_id: String, reason: String },
    SetThrottle { level: ThrottleLevel, reason: String },
    RunCleanup,
    UpdateConfig { config: RateLimitConfig },
}

impl AdminAction {
    /// Execute the admin action
    pub async fn execute(&self, manager: &RateLimitManager) -> anyhow::Result<()> {
        match self {
            AdminAction::CreateRule { rule } => {
                manager.create_rule(rule.clone()).await?;
            }
            AdminAction::UpdateRule { rule_id, update } => {
                manager.update_rule(rule_id, update.clone()).await?;
            }
            AdminAction::DeleteRule { rule_id } => {
                if !manager.delete_rule(rule_id).await? {
                    return Err(Error::NotFound(format!("rule {}", rule_id)).into());
                }
            }
            AdminAction::SetUserReputation {
                user_id,
                score,
                reason,
            } => {
                reputation(manager)?
                    .set_user_reputation(user_id, *score, reason)
                    .await?;
            }
            AdminAction::SetVipTier {
                user_id,
                vip_tier,
                expires_at,
                reason,
            } => {
                reputation(manager)?
                    .set_vip_tier(user_id, *vip_tier, *expires_at, reason)
                    .await?;
            }
            AdminAction::RemoveVipTier { user_id, reason } => {
                reputation(manager)?.remove_vip_tier(user_id, reason).await?;
            }
            AdminAction::SetThrottle { level, reason } => {
                let throttler = manager
                    .throttler()
                    .ok_or_else(|| anyhow::anyhow!("auto-throttling is not configured"))?;
                throttler.manually_set_throttle(*level, reason);
            }
            AdminAction::RunCleanup => {
                manager.run_cleanup().await?;
            }
            AdminAction::UpdateConfig { config } => {
                manager.update_config(config.clone()).await?;
            }
        }
        Ok(())
    }
}

fn reputation(manager: &RateLimitManager) -> anyhow::Result<&crate::reputation::ReputationManager> {
    manager
        .reputation()
        .map(|r| r.as_ref())
        .ok_or_else(|| anyhow::anyhow!("reputation tracking is not configured"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::rate_limit::decision::LimitCheckRequest;
    use crate::rate_limit::rules::{LimitType, Scope};
    use crate::reputation::{ReputationConfig, ReputationManager};

    fn config() -> RateLimitConfig {
        RateLimitConfig {
            bucket_cleanup_interval_secs: 0,
            ..RateLimitConfig::default()
        }
    }

    #[tokio::test]
    async fn test_dashboard_builder() {
        let manager = RateLimitManager::builder(config()).build().unwrap();
        manager
            .create_rule(NewRule::new("shop", Scope::Ip, LimitType::Daily, 1))
            .await
            .unwrap();

        let ctx = RequestContext::background();
        let req = LimitCheckRequest::new("shop", Scope::Ip, "10.0.0.1");
        manager.check_limit(&ctx, &req).await.unwrap();
        manager.check_limit(&ctx, &req).await.unwrap();

        let dashboard = DashboardBuilder::new(&manager, "shop").build().await.unwrap();
        assert_eq!(dashboard.rules.len(), 1);
        assert_eq!(dashboard.recent_violations.len(), 1);
        assert_eq!(dashboard.violation_stats.total, 1);
        assert_eq!(dashboard.allow_rate_1h, Some(0.5));
        assert!(dashboard.reputation.is_none());
        assert!(dashboard.throttle.is_none());
    }

    #[tokio::test]
    async fn test_admin_actions() {
        let reputation = ReputationManager::builder(ReputationConfig {
            decay_interval_secs: 0,
            ..ReputationConfig::default()
        })
        .build()
        .await
        .unwrap();
        let manager = RateLimitManager::builder(config())
            .reputation(reputation.clone())
            .build()
            .unwrap();

        AdminAction::CreateRule {
            rule: NewRule::new("shop", Scope::User, LimitType::Daily, 10),
        }
        .execute(&manager)
        .await
        .unwrap();
        assert_eq!(manager.get_rules("shop").await.len(), 1);

        AdminAction::SetUserReputation {
            user_id: "alice".into(),
            score: 90.0,
            reason: "trusted partner".into(),
        }
        .execute(&manager)
        .await
        .unwrap();
        let user = reputation.get_user_reputation("alice").await.unwrap();
        assert_eq!(user.score, 90.0);

        // No throttler configured
        assert!(AdminAction::SetThrottle {
            level: ThrottleLevel::High,
            reason: "test".into(),
        }
        .execute(&manager)
        .await
        .is_err());

        assert!(AdminAction::DeleteRule {
            rule_id: "missing".into()
        }
        .execute(&manager)
        .await
        .is_err());
    }

    #[test]
    fn test_admin_action_json() {
        let action: AdminAction = serde_json::from_str(
            r#"{"action": "set_throttle", "level": "critical", "reason": "incident"}"#,
        )
        .unwrap();
        assert!(matches!(
            action,
            AdminAction::SetThrottle {
                level: ThrottleLevel::Critical,
                ..
            }
        ));
    }
}
