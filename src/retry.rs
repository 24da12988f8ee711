// Exponential backoff for outbound HTTP calls
//
// Shared by peer replication pushes and the webhook notifier:
// - Exponential backoff (base, 2x base, 4x base, ...)
// - Bounded number of attempts
// - Jitter so peers recovering together do not retry in lockstep

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Retry strategy configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Base delay in milliseconds
    pub base_delay_ms: u64,
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Upper bound for a single delay in milliseconds
    pub max_delay_ms: u64,
    /// Add ±20% jitter to each delay
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 200,
            max_retries: 2,
            max_delay_ms: 5_000,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Retry decision for a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Retry after this many milliseconds
    Retry(u64),
    /// Stop retrying
    GiveUp,
}

/// Calculate the delay before retry number `attempt` (zero-indexed)
///
/// delay = min(base * 2^attempt, max) ± jitter
pub fn calculate_retry_delay(attempt: u32, config: &RetryConfig) -> RetryDecision {
    if attempt >= config.max_retries {
        debug!("Max retries ({}) exceeded, giving up", config.max_retries);
        return RetryDecision::GiveUp;
    }

    let delay_ms = config
        .base_delay_ms
        .saturating_mul(2_u64.saturating_pow(attempt))
        .min(config.max_delay_ms);

    let delay_ms = if config.use_jitter && delay_ms > 0 {
        let jitter = (delay_ms as f64 * 0.2) as u64;
        let mut rng = rand::rng();
        let offset = rng.random_range(0..=jitter);
        if rng.random_bool(0.5) {
            delay_ms.saturating_add(offset)
        } else {
            delay_ms.saturating_sub(offset)
        }
    } else {
        delay_ms
    };

    RetryDecision::Retry(delay_ms)
}

/// Timeout for an attempt, growing by half the base per attempt, capped at 60s
pub fn attempt_timeout(attempt: u32, base: Duration) -> Duration {
    let multiplier = 1.0 + (attempt as f64 * 0.5);
    base.mul_f64(multiplier).min(Duration::from_secs(60))
}

/// HTTP statuses worth retrying
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}
