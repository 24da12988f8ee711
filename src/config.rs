// Configuration File Support
//
// TOML configuration for the ratewarden service with environment variable
// overrides. The default location is the XDG config directory:
// ~/.config/ratewarden/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::notify::NotifyConfig;
use crate::rate_limit::{NewRule, RateLimitConfig};
use crate::replication::ReplicationConfig;
use crate::reputation::ReputationConfig;
use crate::throttle::ThrottleConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,

    /// Decision engine, rule cache and retention
    pub rate_limit: RateLimitConfig,

    pub reputation: ReputationConfig,

    /// Peer replication of reputation events
    pub replication: ReplicationConfig,

    /// Load-based throttling
    pub throttle: ThrottleConfig,

    /// Notification channels
    pub notify: NotifyConfig,

    /// HTTP server for metrics, health and replication
    pub server: ServerConfig,

    /// Rules created at startup
    pub rules: Vec<NewRule>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,

    /// Address to bind (default: 0.0.0.0)
    pub bind: String,

    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0".to_string(),
            port: 9100,
        }
    }
}

impl Config {
    /// Load configuration from the default XDG config directory
    ///
    /// If the config file does not exist, returns the default configuration
    /// with environment overrides applied.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/ratewarden/config.toml` on Linux
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "ratewarden", "Ratewarden") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config").join("ratewarden").join("config.toml")
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - RATEWARDEN_LOG_LEVEL
    /// - RATEWARDEN_LOG_FORMAT
    /// - RATEWARDEN_SERVER_PORT
    /// - RATEWARDEN_NODE_ID
    /// - RATEWARDEN_REPLICATION_ENABLED
    /// - RATEWARDEN_THROTTLE_ENABLED
    /// - RATEWARDEN_SNAPSHOT_PATH
    /// - the rate limit overrides of [`RateLimitConfig::with_env_overrides`]
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(level) = std::env::var("RATEWARDEN_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("RATEWARDEN_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Ok(port) = std::env::var("RATEWARDEN_SERVER_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.server.port = port;
            }
        }

        if let Ok(node_id) = std::env::var("RATEWARDEN_NODE_ID") {
            if !node_id.trim().is_empty() {
                self.replication.node_id = node_id;
            }
        }
        if let Ok(enabled) = std::env::var("RATEWARDEN_REPLICATION_ENABLED") {
            self.replication.enabled = enabled.parse().unwrap_or(self.replication.enabled);
        }

        if let Ok(enabled) = std::env::var("RATEWARDEN_THROTTLE_ENABLED") {
            self.throttle.enabled = enabled.parse().unwrap_or(self.throttle.enabled);
        }

        if let Ok(path) = std::env::var("RATEWARDEN_SNAPSHOT_PATH") {
            self.reputation.snapshot_path = Some(path).filter(|p| !p.is_empty());
        }

        self.rate_limit = self.rate_limit.with_env_overrides();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        if self.server.enabled && self.server.port == 0 {
            anyhow::bail!("Server port must be > 0");
        }

        self.rate_limit
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid rate_limit section: {}", e))?;
        self.reputation
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid reputation section: {}", e))?;
        self.replication
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid replication section: {}", e))?;
        self.throttle
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid throttle section: {}", e))?;

        for (i, rule) in self.rules.iter().enumerate() {
            if rule.limit_value == 0 {
                anyhow::bail!("Rule #{} has limit_value 0", i + 1);
            }
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }

    /// Serialize the effective configuration
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}
