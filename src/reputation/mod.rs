//! User Reputation
//!
//! Per-user scores in [0, 100] that scale rate limits up for well-behaved
//! users and down for abusive ones.
//!
//! ```text
//!   record_violation ──┐
//!   record_clean ──────┤      ┌──────────────────┐     ┌──────────────┐
//!   set_user_reputation├────► │ ReputationStore  │     │  EventSink   │
//!   set_vip_tier ──────┤      │ (score, tier,    │ ──► │ journal or   │
//!   decay job ─────────┘      │  multiplier)     │     │ replication  │
//!                             └──────────────────┘     └──────────────┘
//! ```

pub mod config;
pub mod event;
pub mod journal;
pub mod manager;
pub mod store;
pub mod tier;

pub use config::ReputationConfig;
pub use event::{EventSink, EventType, ReputationEvent};
pub use journal::{EventJournal, JournalPage, JournalStats};
pub use manager::{RepStats, ReputationManager, ReputationManagerBuilder, TrendPoint, UserPage};
pub use store::{ReputationSnapshot, UserReputation};
pub use tier::{score_multiplier, tier_for_score, Tier, VipTier};

#[cfg(test)]
mod proptests {
    use super::tier::{effective_multiplier, score_multiplier, tier_for_score};
    use super::VipTier;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn multiplier_is_monotonic(a in 0.0f64..=100.0, b in 0.0f64..=100.0) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(score_multiplier(lo) <= score_multiplier(hi));
            prop_assert!(tier_for_score(lo) <= tier_for_score(hi));
        }

        #[test]
        fn multiplier_is_bounded(score in -50.0f64..=150.0) {
            let m = score_multiplier(score);
            prop_assert!((0.5..=2.0).contains(&m));
        }

        #[test]
        fn vip_never_lowers_multiplier(score in 0.0f64..=100.0) {
            for vip in [VipTier::Premium, VipTier::Enterprise, VipTier::Internal] {
                prop_assert!(effective_multiplier(score, Some(vip)) >= score_multiplier(score));
            }
        }
    }
}
