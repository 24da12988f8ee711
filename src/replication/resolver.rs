//! Conflict resolution between node views of a user.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::reputation::Tier;

/// Strategy for reconciling a local view with a remote one
pub trait ConflictResolver: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn resolve_score(
        &self,
        local: f64,
        remote: f64,
        local_time: DateTime<Utc>,
        remote_time: DateTime<Utc>,
    ) -> f64;

    fn resolve_tier(
        &self,
        local: Tier,
        remote: Tier,
        local_time: DateTime<Utc>,
        remote_time: DateTime<Utc>,
    ) -> Tier;
}

/// Last write wins; the local view is kept on equal timestamps
#[derive(Debug, Default, Clone, Copy)]
pub struct TimestampResolver;

impl ConflictResolver for TimestampResolver {
    fn name(&self) -> &str {
        "timestamp"
    }

    fn resolve_score(&self, local: f64, remote: f64, local_time: DateTime<Utc>, remote_time: DateTime<Utc>) -> f64 {
        if remote_time > local_time {
            remote
        } else {
            local
        }
    }

    fn resolve_tier(&self, local: Tier, remote: Tier, local_time: DateTime<Utc>, remote_time: DateTime<Utc>) -> Tier {
        if remote_time > local_time {
            remote
        } else {
            local
        }
    }
}

/// Always keeps the lower score and the more restrictive tier
#[derive(Debug, Default, Clone, Copy)]
pub struct ConservativeResolver;

impl ConflictResolver for ConservativeResolver {
    fn name(&self) -> &str {
        "conservative"
    }

    fn resolve_score(&self, local: f64, remote: f64, _: DateTime<Utc>, _: DateTime<Utc>) -> f64 {
        local.min(remote)
    }

    fn resolve_tier(&self, local: Tier, remote: Tier, _: DateTime<Utc>, _: DateTime<Utc>) -> Tier {
        local.min(remote)
    }
}

/// Resolvers selectable by name from configuration
#[derive(Debug, Clone)]
pub struct ResolverRegistry {
    resolvers: HashMap<String, Arc<dyn ConflictResolver>>,
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        let mut registry = Self {
            resolvers: HashMap::new(),
        };
        registry.register(Arc::new(TimestampResolver));
        registry.register(Arc::new(ConservativeResolver));
        registry
    }
}

impl ResolverRegistry {
    pub fn register(&mut self, resolver: Arc<dyn ConflictResolver>) {
        self.resolvers.insert(resolver.name().to_string(), resolver);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ConflictResolver>> {
        self.resolvers.get(name).cloned()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.resolvers.keys().cloned().collect();
        names.sort();
        names
    }
}
