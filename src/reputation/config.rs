// Reputation configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reputation manager configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReputationConfig {
    /// Score of a user seen for the first time
    pub initial_score: f64,
    /// Points lost per severity level of a violation
    pub violation_penalty: f64,
    /// Points gained per clean request
    pub clean_reward: f64,
    /// Clean requests between journalled clean events
    pub clean_event_interval: u64,
    /// Points moved toward neutral per decay pass
    pub decay_step: f64,
    /// Seconds between decay passes; 0 disables the job
    pub decay_interval_secs: u64,
    /// Read cache lifetime in seconds
    pub cache_ttl_secs: u64,
    pub cache_size: usize,
    /// Service name stamped on journalled events
    pub source_service: String,
    /// JSON snapshot of users and events; loaded on start, written on close
    pub snapshot_path: Option<String>,
    /// Seconds between periodic snapshots; 0 writes only on close
    pub snapshot_interval_secs: u64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            initial_score: 50.0,
            violation_penalty: 3.0,
            clean_reward: 1.0,
            clean_event_interval: 100,
            decay_step: 5.0,
            decay_interval_secs: 7 * 24 * 3600,
            cache_ttl_secs: 300,
            cache_size: 10_000,
            source_service: "ratewarden".to_string(),
            snapshot_path: None,
            snapshot_interval_secs: 300,
        }
    }
}

impl ReputationConfig {
    pub fn decay_interval(&self) -> Duration {
        Duration::from_secs(self.decay_interval_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=100.0).contains(&self.initial_score) {
            return Err(format!("initial_score must be within 0..=100, got {}", self.initial_score));
        }
        if self.violation_penalty < 0.0 || self.clean_reward < 0.0 || self.decay_step < 0.0 {
            return Err("reputation score steps must not be negative".to_string());
        }
        if self.clean_event_interval == 0 {
            return Err("clean_event_interval must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReputationConfig::default();
        assert_eq!(config.initial_score, 50.0);
        assert_eq!(config.decay_interval(), Duration::from_secs(604_800));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range_score() {
        let config = ReputationConfig {
            initial_score: 120.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let config: ReputationConfig = toml::from_str("decay_step = 2.5\n").unwrap();
        assert_eq!(config.decay_step, 2.5);
        assert_eq!(config.clean_event_interval, 100);
    }
}
