//! Rule-Based Rate Limiting and Quotas
//!
//! Decides whether a request identified by IP, session, user or API key may
//! proceed. Rules are evaluated in priority order; short windows are counted
//! in fixed-window buckets and long periods in calendar quotas.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Rate Limit Manager                       │
//! │        check_limit → Decision (+ headers, 429 body)         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐  ┌──────────────────┐  ┌──────────────┐    │
//! │  │ Rule Store  │  │ Bucket Accountant│  │ Quota Tracker│    │
//! │  │ (TTL cache) │  │ (sec/min/hour)   │  │ (day/wk/mon) │    │
//! │  └─────────────┘  └──────────────────┘  └──────────────┘    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │   Limit Store (buckets, quotas, violations, metrics)│    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod bucket;
pub mod config;
pub mod dashboard;
pub mod decision;
pub mod manager;
pub mod quota;
pub mod rules;
pub mod store;

pub use config::RateLimitConfig;
pub use dashboard::{AdminAction, DashboardBuilder, DashboardData};
pub use decision::{final_limit, Decision, LimitCheckRequest};
pub use manager::{CleanupReport, RateLimitManager, RateLimitManagerBuilder, RuleUsage, ViolationStats};
pub use rules::{LimitType, NewRule, Rule, RuleUpdate, Scope};
pub use store::{LimitStore, MemoryLimitStore, Quota, StoreStats, Violation};
