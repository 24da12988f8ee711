//! Load-based auto-throttling
//!
//! ```text
//!  ResourceMonitor ──sample──► AutoThrottler ──level──► multiplier
//!  (sysinfo + tokio)           (state machine,          (1.0 .. 0.2)
//!                               history)
//! ```

pub mod config;
pub mod monitor;
pub mod throttler;

pub use config::{LevelMultipliers, LevelThresholds, ThrottleConfig};
pub use monitor::{FixedMonitor, ResourceMonitor, ResourceSample, SysinfoMonitor};
pub use throttler::{
    determine_level, AutoThrottler, AutoThrottlerBuilder, SystemMetrics, ThrottleEvent, ThrottleLevel,
    ThrottleStats,
};
