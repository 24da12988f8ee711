//! Bucket Accountant
//!
//! Fixed-window request counters for `per_second`, `per_minute` and
//! `per_hour` rules. Windows are aligned to the Unix epoch so that every
//! node computes the same window for the same instant.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::rules::Rule;
use super::store::{BucketKey, LimitStore};
use crate::error::{Error, Result};

/// Counter state of the current window after a hit or peek
#[derive(Debug, Clone, PartialEq)]
pub struct WindowUsage {
    pub count: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// Start and end of the window containing `now`
pub fn window_bounds(rule: &Rule, now: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let window = rule.limit_type.window().ok_or_else(|| {
        Error::Validation(format!("{} is not a window limit", rule.limit_type))
    })?;
    let size = window.num_seconds().max(1);
    let start_secs = now.timestamp().div_euclid(size) * size;
    let start = DateTime::from_timestamp(start_secs, 0)
        .ok_or_else(|| Error::Validation(format!("timestamp out of range: {}", start_secs)))?;
    Ok((start, start + window))
}

/// Window counter operations over a [`LimitStore`]
#[derive(Debug, Clone)]
pub struct BucketAccountant {
    store: Arc<dyn LimitStore>,
}

impl BucketAccountant {
    pub fn new(store: Arc<dyn LimitStore>) -> Self {
        Self { store }
    }

    fn key(rule: &Rule, scope_value: &str, resource_type: Option<&str>, start: DateTime<Utc>) -> BucketKey {
        BucketKey {
            rule_id: rule.id.clone(),
            scope: rule.scope,
            scope_value: scope_value.to_string(),
            resource_type: resource_type.map(str::to_string),
            window_start: start,
        }
    }

    /// Count one request in the current window
    pub async fn hit(
        &self,
        rule: &Rule,
        scope_value: &str,
        resource_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<WindowUsage> {
        let (start, end) = window_bounds(rule, now)?;
        let key = Self::key(rule, scope_value, resource_type, start);
        let bucket = self.store.increment_bucket(&key, end, 1).await?;
        Ok(WindowUsage {
            count: bucket.request_count,
            window_start: start,
            window_end: bucket.window_end,
        })
    }

    /// Read the current window without counting
    pub async fn peek(
        &self,
        rule: &Rule,
        scope_value: &str,
        resource_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<WindowUsage> {
        let (start, end) = window_bounds(rule, now)?;
        let key = Self::key(rule, scope_value, resource_type, start);
        let count = self
            .store
            .get_bucket(&key)
            .await?
            .map(|b| b.request_count)
            .unwrap_or(0);
        Ok(WindowUsage {
            count,
            window_start: start,
            window_end: end,
        })
    }

    /// Delete windows that ended before `before`
    pub async fn cleanup(&self, before: DateTime<Utc>) -> Result<usize> {
        self.store.delete_buckets_before(before).await
    }
}
