//! Ratewarden Library
//!
//! Adaptive admission control: per-scope rate rules and calendar quotas,
//! user reputation that scales limits, cross-node replication of reputation
//! events, and load-based throttling.
//!
//! The entry point is [`rate_limit::RateLimitManager`]. Reputation and
//! throttling are optional collaborators handed to its builder.

pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod notify;
pub mod rate_limit;
pub mod replication;
pub mod reputation;
pub mod retry;
pub mod server;
pub mod throttle;

pub use clock::{Clock, ManualClock, SharedClock};
pub use context::RequestContext;
pub use error::{Error, Result};
pub use rate_limit::{Decision, LimitCheckRequest, RateLimitManager};
