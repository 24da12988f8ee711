//! Score bands and limit multipliers.
//!
//! [`Tier`] and the score multiplier are pure, monotonic functions of the
//! score. VIP status is a separate overlay ([`VipTier`]) and never appears
//! as a tier.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Lowest possible score
pub const MIN_SCORE: f64 = 0.0;
/// Highest possible score
pub const MAX_SCORE: f64 = 100.0;
/// Score of a new user and the decay target
pub const NEUTRAL_SCORE: f64 = 50.0;
/// Multiplier forced by premium VIP status
pub const PREMIUM_VIP_MULTIPLIER: f64 = 2.0;
/// Minimum multiplier for the other VIP tiers
pub const VIP_MULTIPLIER_FLOOR: f64 = 1.5;

/// Reputation band derived from the score
///
/// Ordered from most to least restrictive.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Score ≤ 20
    Flagged,
    /// 20 < score ≤ 80
    Standard,
    /// 80 < score ≤ 100
    Trusted,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Flagged => "flagged",
            Tier::Standard => "standard",
            Tier::Trusted => "trusted",
        }
    }

    /// Upper score bound of the band
    pub fn upper_bound(&self) -> f64 {
        match self {
            Tier::Flagged => 20.0,
            Tier::Standard => 80.0,
            Tier::Trusted => MAX_SCORE,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flagged" => Ok(Tier::Flagged),
            "standard" => Ok(Tier::Standard),
            "trusted" => Ok(Tier::Trusted),
            other => Err(Error::Validation(format!("unknown tier: {}", other))),
        }
    }
}

/// Manually assigned VIP overlay
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VipTier {
    Premium,
    Enterprise,
    Internal,
}

impl VipTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            VipTier::Premium => "premium",
            VipTier::Enterprise => "enterprise",
            VipTier::Internal => "internal",
        }
    }
}

impl fmt::Display for VipTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VipTier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "premium" => Ok(VipTier::Premium),
            "enterprise" => Ok(VipTier::Enterprise),
            "internal" => Ok(VipTier::Internal),
            other => Err(Error::Validation(format!("unknown VIP tier: {}", other))),
        }
    }
}

/// Clamp a score into [0, 100]
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        return NEUTRAL_SCORE;
    }
    score.clamp(MIN_SCORE, MAX_SCORE)
}

/// Band for a score
pub fn tier_for_score(score: f64) -> Tier {
    if score <= 20.0 {
        Tier::Flagged
    } else if score <= 80.0 {
        Tier::Standard
    } else {
        Tier::Trusted
    }
}

/// Piecewise-linear limit multiplier for a score
///
/// 0.5 up to 20, then 0.75→1.0 across 20–50, 1.0→1.5 across 50–80 and
/// 1.5→2.0 across 80–100.
pub fn score_multiplier(score: f64) -> f64 {
    let score = clamp_score(score);
    if score <= 20.0 {
        0.5
    } else if score <= 50.0 {
        0.75 + (score - 20.0) / 30.0 * 0.25
    } else if score <= 80.0 {
        1.0 + (score - 50.0) / 30.0 * 0.5
    } else {
        1.5 + (score - 80.0) / 20.0 * 0.5
    }
}

/// Multiplier after applying an active VIP overlay
pub fn effective_multiplier(score: f64, vip: Option<VipTier>) -> f64 {
    let base = score_multiplier(score);
    match vip {
        Some(VipTier::Premium) => PREMIUM_VIP_MULTIPLIER,
        Some(_) => base.max(VIP_MULTIPLIER_FLOOR),
        None => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_bands() {
        assert_eq!(tier_for_score(0.0), Tier::Flagged);
        assert_eq!(tier_for_score(20.0), Tier::Flagged);
        assert_eq!(tier_for_score(20.5), Tier::Standard);
        assert_eq!(tier_for_score(80.0), Tier::Standard);
        assert_eq!(tier_for_score(80.1), Tier::Trusted);
        assert_eq!(tier_for_score(100.0), Tier::Trusted);
    }

    #[test]
    fn test_multiplier_anchor_points() {
        assert_eq!(score_multiplier(10.0), 0.5);
        assert_eq!(score_multiplier(20.0), 0.5);
        assert!((score_multiplier(50.0) - 1.0).abs() < 1e-9);
        assert!((score_multiplier(80.0) - 1.5).abs() < 1e-9);
        assert!((score_multiplier(100.0) - 2.0).abs() < 1e-9);
        assert!((score_multiplier(35.0) - 0.875).abs() < 1e-9);
    }

    #[test]
    fn test_vip_overlay() {
        assert_eq!(effective_multiplier(5.0, Some(VipTier::Premium)), 2.0);
        assert_eq!(effective_multiplier(5.0, Some(VipTier::Enterprise)), 1.5);
        assert!((effective_multiplier(100.0, Some(VipTier::Internal)) - 2.0).abs() < 1e-9);
        assert_eq!(effective_multiplier(5.0, None), 0.5);
    }

    #[test]
    fn test_tier_order_is_restrictiveness() {
        assert!(Tier::Flagged < Tier::Standard);
        assert!(Tier::Standard < Tier::Trusted);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("trusted".parse::<Tier>().unwrap(), Tier::Trusted);
        assert!("premium_vip".parse::<Tier>().is_err());
        assert_eq!("premium".parse::<VipTier>().unwrap(), VipTier::Premium);
    }
}
