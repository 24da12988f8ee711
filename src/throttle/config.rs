// Auto-throttle configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::throttler::ThrottleLevel;

/// Per-level thresholds for one metric, compared with `>=`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LevelThresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl LevelThresholds {
    /// Most severe level whose threshold `value` reaches
    pub fn level_for(&self, value: f64) -> ThrottleLevel {
        if value >= self.critical {
            ThrottleLevel::Critical
        } else if value >= self.high {
            ThrottleLevel::High
        } else if value >= self.medium {
            ThrottleLevel::Medium
        } else if value >= self.low {
            ThrottleLevel::Low
        } else {
            ThrottleLevel::None
        }
    }

    fn is_ascending(&self) -> bool {
        self.low <= self.medium && self.medium <= self.high && self.high <= self.critical
    }
}

/// Limit multiplier applied at each level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LevelMultipliers {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for LevelMultipliers {
    fn default() -> Self {
        Self {
            low: 0.8,
            medium: 0.6,
            high: 0.4,
            critical: 0.2,
        }
    }
}

impl LevelMultipliers {
    pub fn for_level(&self, level: ThrottleLevel) -> f64 {
        match level {
            ThrottleLevel::None => 1.0,
            ThrottleLevel::Low => self.low,
            ThrottleLevel::Medium => self.medium,
            ThrottleLevel::High => self.high,
            ThrottleLevel::Critical => self.critical,
        }
    }
}

/// Auto-throttler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Run the sampling loop
    pub enabled: bool,
    pub sample_interval_secs: u64,
    /// Minimum time at a level before the sampler may lower it
    pub recovery_cooldown_secs: u64,
    /// Throttle events kept in memory
    pub history_limit: usize,
    /// CPU usage in percent
    pub cpu: LevelThresholds,
    /// Memory usage in percent
    pub memory: LevelThresholds,
    /// Live runtime tasks
    pub tasks: LevelThresholds,
    pub multipliers: LevelMultipliers,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_secs: 10,
            recovery_cooldown_secs: 30,
            history_limit: 1000,
            cpu: LevelThresholds {
                low: 50.0,
                medium: 70.0,
                high: 85.0,
                critical: 95.0,
            },
            memory: LevelThresholds {
                low: 60.0,
                medium: 75.0,
                high: 85.0,
                critical: 95.0,
            },
            tasks: LevelThresholds {
                low: 1_000.0,
                medium: 5_000.0,
                high: 10_000.0,
                critical: 50_000.0,
            },
            multipliers: LevelMultipliers::default(),
        }
    }
}

impl ThrottleConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn recovery_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.recovery_cooldown_secs.min(i64::MAX as u64) as i64)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        for (name, thresholds) in [("cpu", &self.cpu), ("memory", &self.memory), ("tasks", &self.tasks)] {
            if !thresholds.is_ascending() {
                return Err(format!("{} thresholds must be ascending from low to critical", name));
            }
        }
        let m = &self.multipliers;
        for value in [m.low, m.medium, m.high, m.critical] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(format!("throttle multipliers must be within (0, 1], got {}", value));
            }
        }
        if self.history_limit == 0 {
            return Err("history_limit must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ThrottleConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sample_interval(), Duration::from_secs(10));
        assert_eq!(config.multipliers.for_level(ThrottleLevel::None), 1.0);
        assert_eq!(config.multipliers.for_level(ThrottleLevel::Critical), 0.2);
    }

    #[test]
    fn test_thresholds_are_inclusive() {
        let config = ThrottleConfig::default();
        assert_eq!(config.cpu.level_for(49.9), ThrottleLevel::None);
        assert_eq!(config.cpu.level_for(50.0), ThrottleLevel::Low);
        assert_eq!(config.cpu.level_for(95.0), ThrottleLevel::Critical);
    }

    #[test]
    fn test_validate_rejects_descending_thresholds() {
        let mut config = ThrottleConfig::default();
        config.memory.high = 99.0;
        assert!(config.validate().is_err());

        let mut config = ThrottleConfig::default();
        config.multipliers.critical = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: ThrottleConfig = toml::from_str(
            r#"
            recovery_cooldown_secs = 5

            [multipliers]
            critical = 0.1
            "#,
        )
        .unwrap();
        assert_eq!(config.recovery_cooldown_secs, 5);
        assert_eq!(config.multipliers.critical, 0.1);
        assert_eq!(config.multipliers.low, 0.8);
        assert_eq!(config.cpu.critical, 95.0);
    }
}
