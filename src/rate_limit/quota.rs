//! Quota Tracker
//!
//! Calendar-period usage counters for `daily`, `weekly` and `monthly`
//! rules. Periods are computed in UTC (weeks start on Monday). A new
//! period row is created by the first request that lands in it; there is
//! no reset timer.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use std::sync::Arc;

use super::rules::{LimitType, Rule};
use super::store::{LimitStore, Quota, QuotaKey, QuotaSelector};
use crate::error::{Error, Result};

fn midnight(date: NaiveDate) -> Result<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .ok_or_else(|| Error::Validation(format!("invalid date: {}", date)))
}

fn first_of_month(year: i32, month: u32) -> Result<DateTime<Utc>> {
    let date = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| Error::Validation(format!("invalid month: {}-{}", year, month)))?;
    midnight(date)
}

/// Start and end of the period of `limit_type` containing `now`
pub fn period_bounds(limit_type: LimitType, now: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let today = now.date_naive();
    match limit_type {
        LimitType::Daily => {
            let start = midnight(today)?;
            Ok((start, start + Duration::days(1)))
        }
        LimitType::Weekly => {
            let offset = today.weekday().num_days_from_monday() as i64;
            let start = midnight(today - Duration::days(offset))?;
            Ok((start, start + Duration::weeks(1)))
        }
        LimitType::Monthly => {
            let start = first_of_month(today.year(), today.month())?;
            let end = if today.month() == 12 {
                first_of_month(today.year() + 1, 1)?
            } else {
                first_of_month(today.year(), today.month() + 1)?
            };
            Ok((start, end))
        }
        other => Err(Error::Validation(format!("{} is not a period limit", other))),
    }
}

/// Period counter operations over a [`LimitStore`]
#[derive(Debug, Clone)]
pub struct QuotaTracker {
    store: Arc<dyn LimitStore>,
}

impl QuotaTracker {
    pub fn new(store: Arc<dyn LimitStore>) -> Self {
        Self { store }
    }

    fn key(
        rule: &Rule,
        system_id: &str,
        scope_value: &str,
        resource_type: Option<&str>,
        period_start: DateTime<Utc>,
    ) -> QuotaKey {
        QuotaKey {
            system_id: system_id.to_string(),
            rule_id: rule.id.clone(),
            scope: rule.scope,
            scope_value: scope_value.to_string(),
            resource_type: resource_type.map(str::to_string),
            period: rule.limit_type,
            period_start,
        }
    }

    /// Charge `amount` units against the current period of `rule`
    pub async fn hit(
        &self,
        rule: &Rule,
        system_id: &str,
        scope_value: &str,
        resource_type: Option<&str>,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Quota> {
        let (start, end) = period_bounds(rule.limit_type, now)?;
        let key = Self::key(rule, system_id, scope_value, resource_type, start);
        self.store
            .increment_quota(&key, rule.limit_value as u64, end, amount)
            .await
    }

    /// Read the current period of `rule` without charging
    pub async fn peek(
        &self,
        rule: &Rule,
        system_id: &str,
        scope_value: &str,
        resource_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Quota>> {
        let (start, _) = period_bounds(rule.limit_type, now)?;
        let key = Self::key(rule, system_id, scope_value, resource_type, start);
        self.store.get_quota(&key).await
    }

    /// The current-period quota of an identity that resets first
    pub async fn current(&self, selector: &QuotaSelector, now: DateTime<Utc>) -> Result<Option<Quota>> {
        let quotas = self
            .store
            .current_quotas(&selector.system_id, selector.scope, &selector.scope_value, now)
            .await?;
        Ok(quotas.into_iter().find(|q| selector.matches(&q.key)))
    }

    /// Delete periods that ended before `before`
    pub async fn cleanup(&self, before: DateTime<Utc>) -> Result<usize> {
        self.store.delete_quotas_before(before).await
    }
}
