//! Rate Limit Configuration
//!
//! Configuration for the decision engine, rule cache and retention jobs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default interval between retention sweeps
pub const DEFAULT_BUCKET_CLEANUP_INTERVAL_SECS: u64 = 600;
/// Default violation retention (7 days)
pub const DEFAULT_VIOLATION_RETENTION_SECS: u64 = 7 * 24 * 3600;
/// Default decision metric retention (30 days)
pub const DEFAULT_METRICS_RETENTION_SECS: u64 = 30 * 24 * 3600;
/// Default rule cache TTL
pub const DEFAULT_RULE_CACHE_TTL_SECS: u64 = 300;
/// Default number of cached rule sets
pub const DEFAULT_RULE_CACHE_SIZE: usize = 1000;
/// Retry-After used when no window end is known
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting; when false every check is allowed
    pub enabled: bool,

    /// Interval between retention sweeps (0 disables the job)
    pub bucket_cleanup_interval_secs: u64,

    /// How long violations are kept
    pub violation_retention_secs: u64,

    /// How long per-decision metric rows are kept
    pub metrics_retention_secs: u64,

    /// Rule cache time-to-live
    pub rule_cache_ttl_secs: u64,

    /// Maximum number of cached per-system rule sets
    pub rule_cache_size: usize,

    /// Record one metric row per decision
    pub enable_metrics: bool,

    /// Persist a violation row for every denied request
    pub enable_violation_tracking: bool,

    /// Retry-After returned when a check fails closed
    pub default_retry_after_secs: u64,

    /// Slack added to Retry-After for clock skew between nodes
    pub clock_tolerance_secs: u64,

    /// Allow requests when a check errors (cancellation, store failure)
    pub fail_open: bool,

    /// Scale rule limits by reputation and throttle multipliers inside the engine
    pub apply_adaptive_limits: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bucket_cleanup_interval_secs: DEFAULT_BUCKET_CLEANUP_INTERVAL_SECS,
            violation_retention_secs: DEFAULT_VIOLATION_RETENTION_SECS,
            metrics_retention_secs: DEFAULT_METRICS_RETENTION_SECS,
            rule_cache_ttl_secs: DEFAULT_RULE_CACHE_TTL_SECS,
            rule_cache_size: DEFAULT_RULE_CACHE_SIZE,
            enable_metrics: true,
            enable_violation_tracking: true,
            default_retry_after_secs: DEFAULT_RETRY_AFTER_SECS,
            clock_tolerance_secs: 1,
            fail_open: false,
            apply_adaptive_limits: false,
        }
    }
}

impl RateLimitConfig {
    /// Create a new rate limit configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `RATEWARDEN_*` environment overrides on top of `self`
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("RATEWARDEN_RATE_LIMIT_ENABLED") {
            self.enabled = val.parse().unwrap_or(self.enabled);
        }

        if let Ok(val) = std::env::var("RATEWARDEN_FAIL_OPEN") {
            self.fail_open = val.parse().unwrap_or(self.fail_open);
        }

        if let Ok(val) = std::env::var("RATEWARDEN_RULE_CACHE_TTL_SECS") {
            if let Ok(ttl) = val.parse() {
                self.rule_cache_ttl_secs = ttl;
            }
        }

        if let Ok(val) = std::env::var("RATEWARDEN_DEFAULT_RETRY_AFTER_SECS") {
            if let Ok(secs) = val.parse() {
                self.default_retry_after_secs = secs;
            }
        }

        if let Ok(val) = std::env::var("RATEWARDEN_CLEANUP_INTERVAL_SECS") {
            if let Ok(secs) = val.parse() {
                self.bucket_cleanup_interval_secs = secs;
            }
        }

        self
    }

    /// Retention sweep interval
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.bucket_cleanup_interval_secs)
    }

    /// Violation retention window
    pub fn violation_retention(&self) -> Duration {
        Duration::from_secs(self.violation_retention_secs)
    }

    /// Metric retention window
    pub fn metrics_retention(&self) -> Duration {
        Duration::from_secs(self.metrics_retention_secs)
    }

    /// Rule cache TTL
    pub fn rule_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.rule_cache_ttl_secs)
    }

    /// Disable rate limiting (for testing)
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.rule_cache_size == 0 {
            return Err("rule_cache_size must be > 0".to_string());
        }
        if self.default_retry_after_secs == 0 {
            return Err("default_retry_after_secs must be > 0".to_string());
        }
        if self.bucket_cleanup_interval_secs > 0
            && self.violation_retention_secs < self.bucket_cleanup_interval_secs
        {
            return Err("violation_retention_secs must cover at least one cleanup interval".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RateLimitConfig::default();
        assert!(config.enabled);
        assert!(!config.fail_open);
        assert_eq!(config.rule_cache_size, DEFAULT_RULE_CACHE_SIZE);
        assert_eq!(config.rule_cache_ttl(), Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_disabled_config() {
        let config = RateLimitConfig::disabled();
        assert!(!config.enabled);
    }

    #[test]
    fn test_retention_durations() {
        let config = RateLimitConfig::default();
        assert_eq!(config.violation_retention(), Duration::from_secs(7 * 24 * 3600));
        assert_eq!(config.metrics_retention(), Duration::from_secs(30 * 24 * 3600));
        assert_eq!(config.cleanup_interval(), Duration::from_secs(600));
    }

    #[test]
    fn test_validate_rejects_zero_cache() {
        let config = RateLimitConfig {
            rule_cache_size: 0,
            ..RateLimitConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: RateLimitConfig = toml::from_str("fail_open = true").unwrap();
        assert!(config.fail_open);
        assert_eq!(config.default_retry_after_secs, DEFAULT_RETRY_AFTER_SECS);
    }
}
