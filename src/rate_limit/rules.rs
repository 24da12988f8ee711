//! Rule Store
//!
//! Admin-managed rule definitions with a priority-ordered, TTL-cached view
//! per system. Rules stored under [`GLOBAL_SYSTEM`] apply to every system.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::cache::TtlCache;
use crate::clock::SharedClock;
use crate::error::{Error, Result};

/// System id whose rules apply everywhere
pub const GLOBAL_SYSTEM: &str = "global";

/// Identity axis a rule applies to
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Ip,
    Session,
    User,
    ApiKey,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Ip => "ip",
            Scope::Session => "session",
            Scope::User => "user",
            Scope::ApiKey => "api_key",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ip" => Ok(Scope::Ip),
            "session" => Ok(Scope::Session),
            "user" => Ok(Scope::User),
            "api_key" => Ok(Scope::ApiKey),
            other => Err(Error::Validation(format!("unknown scope: {}", other))),
        }
    }
}

/// Accounting period of a rule
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    PerSecond,
    PerMinute,
    PerHour,
    Daily,
    Weekly,
    Monthly,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::PerSecond => "per_second",
            LimitType::PerMinute => "per_minute",
            LimitType::PerHour => "per_hour",
            LimitType::Daily => "daily",
            LimitType::Weekly => "weekly",
            LimitType::Monthly => "monthly",
        }
    }

    /// Fixed window length for bucket-accounted types
    pub fn window(&self) -> Option<Duration> {
        match self {
            LimitType::PerSecond => Some(Duration::seconds(1)),
            LimitType::PerMinute => Some(Duration::minutes(1)),
            LimitType::PerHour => Some(Duration::hours(1)),
            _ => None,
        }
    }

    /// Whether counts live in a calendar-period quota rather than a bucket
    pub fn is_period(&self) -> bool {
        self.window().is_none()
    }
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LimitType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "per_second" => Ok(LimitType::PerSecond),
            "per_minute" => Ok(LimitType::PerMinute),
            "per_hour" => Ok(LimitType::PerHour),
            "daily" => Ok(LimitType::Daily),
            "weekly" => Ok(LimitType::Weekly),
            "monthly" => Ok(LimitType::Monthly),
            other => Err(Error::Validation(format!("unknown limit type: {}", other))),
        }
    }
}

/// A stored rate or quota rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub system_id: String,
    pub rule_name: String,
    pub scope: Scope,
    /// `None` matches every value of the scope
    pub scope_value: Option<String>,
    pub limit_type: LimitType,
    pub limit_value: u32,
    /// `None` applies to every resource type
    pub resource_type: Option<String>,
    /// Lower values are evaluated first
    pub priority: i32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    /// Whether this rule governs a request with the given identity
    pub fn matches(&self, scope: Scope, scope_value: &str, resource_type: Option<&str>) -> bool {
        if !self.enabled || self.scope != scope {
            return false;
        }
        if let Some(value) = &self.scope_value {
            if value != scope_value {
                return false;
            }
        }
        match &self.resource_type {
            None => true,
            Some(rt) => resource_type == Some(rt.as_str()),
        }
    }
}

/// Input for creating a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRule {
    #[serde(default = "default_system")]
    pub system_id: String,
    #[serde(default)]
    pub rule_name: Option<String>,
    pub scope: Scope,
    #[serde(default)]
    pub scope_value: Option<String>,
    pub limit_type: LimitType,
    pub limit_value: u32,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_system() -> String {
    GLOBAL_SYSTEM.to_string()
}

fn default_priority() -> i32 {
    100
}

fn default_enabled() -> bool {
    true
}

impl NewRule {
    /// Enabled rule with default priority and no filters
    pub fn new(system_id: &str, scope: Scope, limit_type: LimitType, limit_value: u32) -> Self {
        Self {
            system_id: system_id.to_string(),
            rule_name: None,
            scope,
            scope_value: None,
            limit_type,
            limit_value,
            resource_type: None,
            priority: default_priority(),
            enabled: true,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.rule_name = Some(name.to_string());
        self
    }

    pub fn scope_value(mut self, value: &str) -> Self {
        self.scope_value = Some(value.to_string());
        self
    }

    pub fn resource_type(mut self, resource_type: &str) -> Self {
        self.resource_type = Some(resource_type.to_string());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Partial update applied by [`RuleStore::update`]
///
/// An empty string for `scope_value` or `resource_type` clears the filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleUpdate {
    pub rule_name: Option<String>,
    pub scope_value: Option<String>,
    pub limit_type: Option<LimitType>,
    pub limit_value: Option<u32>,
    pub resource_type: Option<String>,
    pub priority: Option<i32>,
    pub enabled: Option<bool>,
}

fn normalize(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn validate_limit(limit_value: u32) -> Result<()> {
    if limit_value == 0 {
        return Err(Error::Validation("limit_value must be > 0".to_string()));
    }
    Ok(())
}

/// Rule storage with a per-system cache of enabled rules
#[derive(Debug)]
pub struct RuleStore {
    rules: Arc<RwLock<HashMap<String, Rule>>>,
    cache: TtlCache<String, Arc<Vec<Rule>>>,
    clock: SharedClock,
}

impl RuleStore {
    /// Create an empty store
    pub fn new(cache_ttl: std::time::Duration, cache_size: usize, clock: SharedClock) -> Self {
        Self {
            rules: Arc::new(RwLock::new(HashMap::new())),
            cache: TtlCache::new(cache_ttl, cache_size),
            clock,
        }
    }

    /// Create a rule; a name is generated when none is given
    pub async fn create(&self, new: NewRule) -> Result<Rule> {
        if new.system_id.trim().is_empty() {
            return Err(Error::Validation("system_id is required".to_string()));
        }
        validate_limit(new.limit_value)?;

        let now = self.clock.now();
        let rule_name = normalize(new.rule_name).unwrap_or_else(|| {
            format!("{}_{}_{}", new.scope, new.limit_type, new.limit_value)
        });
        let rule = Rule {
            id: uuid::Uuid::new_v4().to_string(),
            system_id: new.system_id,
            rule_name,
            scope: new.scope,
            scope_value: normalize(new.scope_value),
            limit_type: new.limit_type,
            limit_value: new.limit_value,
            resource_type: normalize(new.resource_type),
            priority: new.priority,
            enabled: new.enabled,
            created_at: now,
            updated_at: now,
        };

        self.rules.write().await.insert(rule.id.clone(), rule.clone());
        self.cache.clear();
        info!(
            "Created rule {} ({}) for system {}",
            rule.id, rule.rule_name, rule.system_id
        );
        Ok(rule)
    }

    /// Apply a partial update
    pub async fn update(&self, rule_id: &str, update: RuleUpdate) -> Result<Rule> {
        if let Some(limit) = update.limit_value {
            validate_limit(limit)?;
        }

        let mut rules = self.rules.write().await;
        let rule = rules
            .get_mut(rule_id)
            .ok_or_else(|| Error::NotFound(format!("rule {}", rule_id)))?;

        if let Some(name) = normalize(update.rule_name) {
            rule.rule_name = name;
        }
        if let Some(value) = update.scope_value {
            rule.scope_value = normalize(Some(value));
        }
        if let Some(limit_type) = update.limit_type {
            rule.limit_type = limit_type;
        }
        if let Some(limit) = update.limit_value {
            rule.limit_value = limit;
        }
        if let Some(resource_type) = update.resource_type {
            rule.resource_type = normalize(Some(resource_type));
        }
        if let Some(priority) = update.priority {
            rule.priority = priority;
        }
        if let Some(enabled) = update.enabled {
            rule.enabled = enabled;
        }
        rule.updated_at = self.clock.now();

        let updated = rule.clone();
        drop(rules);
        self.cache.clear();
        info!("Updated rule {}", rule_id);
        Ok(updated)
    }

    /// Delete a rule; deleting an unknown id is not an error
    pub async fn delete(&self, rule_id: &str) -> Result<bool> {
        let removed = self.rules.write().await.remove(rule_id).is_some();
        if removed {
            self.cache.clear();
            info!("Deleted rule {}", rule_id);
        }
        Ok(removed)
    }

    /// Get a rule by id
    pub async fn get(&self, rule_id: &str) -> Option<Rule> {
        self.rules.read().await.get(rule_id).cloned()
    }

    /// All rules of a system, enabled or not, in priority order
    pub async fn list(&self, system_id: &str) -> Vec<Rule> {
        let rules = self.rules.read().await;
        let mut list: Vec<Rule> = rules
            .values()
            .filter(|r| r.system_id == system_id)
            .cloned()
            .collect();
        sort_rules(&mut list);
        list
    }

    /// Enabled rules that apply to a system, global rules included
    pub async fn rules_for_check(&self, system_id: &str) -> Arc<Vec<Rule>> {
        let loaded: std::result::Result<_, Infallible> = self
            .cache
            .get_or_load(&system_id.to_string(), move || async move {
                let rules = self.rules.read().await;
                let mut list: Vec<Rule> = rules
                    .values()
                    .filter(|r| r.enabled && (r.system_id == system_id || r.system_id == GLOBAL_SYSTEM))
                    .cloned()
                    .collect();
                sort_rules(&mut list);
                Ok(Arc::new(list))
            })
            .await;
        match loaded {
            Ok(rules) => rules,
            Err(never) => match never {},
        }
    }

    /// Drop expired cache entries
    pub fn purge_cache(&self) -> usize {
        self.cache.purge_expired()
    }

    /// Number of stored rules
    pub async fn count(&self) -> usize {
        self.rules.read().await.len()
    }
}

fn sort_rules(rules: &mut [Rule]) {
    rules.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;

    fn store() -> RuleStore {
        RuleStore::new(std::time::Duration::from_secs(60), 100, clock::system())
    }

    #[test]
    fn test_scope_round_trip_names() {
        assert_eq!("api_key".parse::<Scope>().unwrap(), Scope::ApiKey);
        assert_eq!(Scope::ApiKey.to_string(), "api_key");
        assert!("device".parse::<Scope>().is_err());
    }

    #[test]
    fn test_limit_type_accounting() {
        assert_eq!(LimitType::PerMinute.window(), Some(Duration::minutes(1)));
        assert!(LimitType::Weekly.is_period());
        assert!(!LimitType::PerHour.is_period());
    }

    #[tokio::test]
    async fn test_create_generates_name() {
        let store = store();
        let rule = store
            .create(NewRule::new("sys", Scope::Ip, LimitType::PerSecond, 5))
            .await
            .unwrap();
        assert_eq!(rule.rule_name, "ip_per_second_5");
        assert!(rule.enabled);
        assert_eq!(store.get(&rule.id).await, Some(rule));
    }

    #[tokio::test]
    async fn test_create_rejects_zero_limit() {
        let store = store();
        let err = store
            .create(NewRule::new("sys", Scope::Ip, LimitType::PerSecond, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_rules_for_check_includes_global_sorted() {
        let store = store();
        store
            .create(NewRule::new("sys", Scope::Ip, LimitType::PerMinute, 100).priority(2))
            .await
            .unwrap();
        store
            .create(NewRule::new(GLOBAL_SYSTEM, Scope::Ip, LimitType::PerSecond, 1).priority(1))
            .await
            .unwrap();
        store
            .create(NewRule::new("other", Scope::Ip, LimitType::PerSecond, 1))
            .await
            .unwrap();
        store
            .create(NewRule::new("sys", Scope::Ip, LimitType::PerHour, 1).disabled())
            .await
            .unwrap();

        let rules = store.rules_for_check("sys").await;
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].priority, 1);
        assert_eq!(rules[0].system_id, GLOBAL_SYSTEM);
        assert_eq!(rules[1].priority, 2);
    }

    #[tokio::test]
    async fn test_mutation_invalidates_cache() {
        let store = store();
        let rule = store
            .create(NewRule::new("sys", Scope::User, LimitType::PerMinute, 10))
            .await
            .unwrap();
        assert_eq!(store.rules_for_check("sys").await.len(), 1);

        store
            .update(
                &rule.id,
                RuleUpdate {
                    enabled: Some(false),
                    ..RuleUpdate::default()
                },
            )
            .await
            .unwrap();
        assert!(store.rules_for_check("sys").await.is_empty());

        store
            .update(
                &rule.id,
                RuleUpdate {
                    enabled: Some(true),
                    ..RuleUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(store.rules_for_check("sys").await.len(), 1);

        assert!(store.delete(&rule.id).await.unwrap());
        assert!(store.rules_for_check("sys").await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_disable_wins_over_concurrent_loads() {
        let store = Arc::new(store());
        for _ in 0..50 {
            let rule = store
                .create(NewRule::new("sys", Scope::User, LimitType::PerMinute, 10))
                .await
                .unwrap();
            let readers: Vec<_> = (0..8)
                .map(|_| {
                    let store = store.clone();
                    tokio::spawn(async move { store.rules_for_check("sys").await.len() })
                })
                .collect();

            store
                .update(
                    &rule.id,
                    RuleUpdate {
                        enabled: Some(false),
                        ..RuleUpdate::default()
                    },
                )
                .await
                .unwrap();
            for reader in readers {
                reader.await.unwrap();
            }
            assert!(store.rules_for_check("sys").await.is_empty());
        }
    }

    #[tokio::test]
    async fn test_update_missing_rule() {
        let store = store();
        let err = store.update("nope", RuleUpdate::default()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(!store.delete("nope").await.unwrap());
        assert!(store.get("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_update_clears_filters() {
        let store = store();
        let rule = store
            .create(
                NewRule::new("sys", Scope::Ip, LimitType::PerMinute, 10)
                    .scope_value("10.0.0.1")
                    .resource_type("upload"),
            )
            .await
            .unwrap();

        let updated = store
            .update(
                &rule.id,
                RuleUpdate {
                    scope_value: Some(String::new()),
                    resource_type: Some(String::new()),
                    ..RuleUpdate::default()
                },
            )
            .await
            .unwrap();
        assert!(updated.scope_value.is_none());
        assert!(updated.resource_type.is_none());
    }

    #[test]
    fn test_rule_matching() {
        let now = Utc::now();
        let rule = Rule {
            id: "r1".into(),
            system_id: "sys".into(),
            rule_name: "uploads".into(),
            scope: Scope::Ip,
            scope_value: None,
            limit_type: LimitType::PerSecond,
            limit_value: 1,
            resource_type: Some("upload".into()),
            priority: 1,
            enabled: true,
            created_at: now,
            updated_at: now,
        };

        assert!(rule.matches(Scope::Ip, "1.2.3.4", Some("upload")));
        assert!(!rule.matches(Scope::Ip, "1.2.3.4", Some("download")));
        assert!(!rule.matches(Scope::Ip, "1.2.3.4", None));
        assert!(!rule.matches(Scope::User, "1.2.3.4", Some("upload")));
    }
}
