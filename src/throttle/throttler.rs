//! Auto-Throttler
//!
//! Samples process load on a fixed interval and maps it to a
//! [`ThrottleLevel`]. The level's multiplier scales every effective limit.
//! Escalation takes effect on the sample that crosses a threshold; lowering
//! the level waits until the current one has been held for the recovery
//! cooldown.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, info, warn};

use super::config::ThrottleConfig;
use super::monitor::{ResourceMonitor, ResourceSample, SysinfoMonitor};
use crate::clock::{self, SharedClock};
use crate::error::{Error, Result};
use crate::lifecycle::BackgroundTask;
use crate::metrics::{CPU_USAGE_PERCENT, LIVE_TASKS, MEMORY_USAGE_PERCENT, THROTTLE_LEVEL, THROTTLE_MULTIPLIER};
use crate::notify::{Notification, NotificationKind, NotifierRegistry, Severity};

/// System-load severity, ordered from none to critical
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl ThrottleLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThrottleLevel::None => "none",
            ThrottleLevel::Low => "low",
            ThrottleLevel::Medium => "medium",
            ThrottleLevel::High => "high",
            ThrottleLevel::Critical => "critical",
        }
    }

    /// Numeric value exported as a gauge
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }
}

impl fmt::Display for ThrottleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThrottleLevel {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(ThrottleLevel::None),
            "low" => Ok(ThrottleLevel::Low),
            "medium" => Ok(ThrottleLevel::Medium),
            "high" => Ok(ThrottleLevel::High),
            "critical" => Ok(ThrottleLevel::Critical),
            other => Err(Error::Validation(format!("unknown throttle level: {}", other))),
        }
    }
}

/// Record of one level transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleEvent {
    pub id: String,
    pub level: ThrottleLevel,
    pub previous_level: ThrottleLevel,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub tasks: u64,
    pub multiplier: f64,
    pub reason: String,
    pub manual: bool,
    pub created_at: DateTime<Utc>,
    /// Set when the next transition replaces this one
    pub resolved_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
}

/// Current level plus the most recent sample
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub tasks: u64,
    pub level: ThrottleLevel,
    pub multiplier: f64,
    pub level_since: DateTime<Utc>,
    pub sampled_at: Option<DateTime<Utc>>,
}

/// Transition summary over a time window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThrottleStats {
    pub window_hours: u32,
    pub total_events: usize,
    pub manual_overrides: usize,
    pub events_by_level: BTreeMap<String, usize>,
    /// Mean time spent at a level, over resolved events in the window
    pub average_duration_secs: Option<f64>,
    pub max_cpu_percent: f64,
    pub max_memory_percent: f64,
    pub current_level: ThrottleLevel,
    pub current_multiplier: f64,
}

/// Level for a sample and the reason text naming every metric that reached
/// a threshold
pub fn determine_level(config: &ThrottleConfig, sample: &ResourceSample) -> (ThrottleLevel, String) {
    let cpu = config.cpu.level_for(sample.cpu_percent);
    let memory = config.memory.level_for(sample.memory_percent);
    let tasks = config.tasks.level_for(sample.tasks as f64);

    let mut parts = Vec::new();
    if cpu > ThrottleLevel::None {
        parts.push(format!("CPU {} ({:.1}%)", cpu, sample.cpu_percent));
    }
    if memory > ThrottleLevel::None {
        parts.push(format!("Memory {} ({:.1}%)", memory, sample.memory_percent));
    }
    if tasks > ThrottleLevel::None {
        parts.push(format!("Tasks {} ({})", tasks, sample.tasks));
    }

    let level = cpu.max(memory).max(tasks);
    let reason = if parts.is_empty() {
        "System load normalized".to_string()
    } else {
        parts.join(" | ")
    };
    (level, reason)
}

#[derive(Debug)]
struct ThrottleState {
    level: ThrottleLevel,
    level_since: DateTime<Utc>,
    last_sample: ResourceSample,
    sampled_at: Option<DateTime<Utc>>,
}

/// Builder for [`AutoThrottler`]
pub struct AutoThrottlerBuilder {
    config: ThrottleConfig,
    monitor: Option<Arc<dyn ResourceMonitor>>,
    clock: Option<SharedClock>,
    notifier: Option<Arc<NotifierRegistry>>,
}

impl AutoThrottlerBuilder {
    pub fn monitor(mut self, monitor: Arc<dyn ResourceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn notifier(mut self, notifier: Arc<NotifierRegistry>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Start the sampler when enabled
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Arc<AutoThrottler>> {
        self.config.validate().map_err(Error::Validation)?;
        let clock = self.clock.unwrap_or_else(clock::system);
        let monitor = self
            .monitor
            .unwrap_or_else(|| Arc::new(SysinfoMonitor::new()));
        let config = self.config;
        let notifier = self.notifier;
        let now = clock.now();

        THROTTLE_LEVEL.set(ThrottleLevel::None.as_i64());
        THROTTLE_MULTIPLIER.set(1.0);

        Ok(Arc::new_cyclic(|weak: &Weak<AutoThrottler>| {
            let sampler = (config.enabled && config.sample_interval_secs > 0).then(|| {
                let weak = weak.clone();
                BackgroundTask::spawn("throttle-sampler", config.sample_interval(), move || {
                    let weak = weak.clone();
                    async move {
                        if let Some(throttler) = weak.upgrade() {
                            throttler.sample_now();
                        }
                    }
                })
            });

            AutoThrottler {
                state: RwLock::new(ThrottleState {
                    level: ThrottleLevel::None,
                    level_since: now,
                    last_sample: ResourceSample::default(),
                    sampled_at: None,
                }),
                history: Mutex::new(VecDeque::new()),
                config,
                monitor,
                clock,
                notifier,
                sampler,
            }
        }))
    }
}

/// Load-driven global limit multiplier
pub struct AutoThrottler {
    config: ThrottleConfig,
    monitor: Arc<dyn ResourceMonitor>,
    clock: SharedClock,
    state: RwLock<ThrottleState>,
    history: Mutex<VecDeque<ThrottleEvent>>,
    notifier: Option<Arc<NotifierRegistry>>,
    sampler: Option<BackgroundTask>,
}

impl fmt::Debug for AutoThrottler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoThrottler")
            .field("config", &self.config)
            .field("monitor", &self.monitor)
            .field("level", &self.get_current_level())
            .finish_non_exhaustive()
    }
}

impl AutoThrottler {
    pub fn builder(config: ThrottleConfig) -> AutoThrottlerBuilder {
        AutoThrottlerBuilder {
            config,
            monitor: None,
            clock: None,
            notifier: None,
        }
    }

    pub fn get_current_level(&self) -> ThrottleLevel {
        self.state.read().unwrap_or_else(|e| e.into_inner()).level
    }

    pub fn get_throttle_multiplier(&self) -> f64 {
        self.config.multipliers.for_level(self.get_current_level())
    }

    pub fn get_system_metrics(&self) -> SystemMetrics {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        SystemMetrics {
            cpu_percent: state.last_sample.cpu_percent,
            memory_percent: state.last_sample.memory_percent,
            tasks: state.last_sample.tasks,
            level: state.level,
            multiplier: self.config.multipliers.for_level(state.level),
            level_since: state.level_since,
            sampled_at: state.sampled_at,
        }
    }

    /// Take one sample and apply any resulting transition
    pub fn sample_now(&self) -> Option<ThrottleEvent> {
        let sample = self.monitor.sample();
        CPU_USAGE_PERCENT.set(sample.cpu_percent);
        MEMORY_USAGE_PERCENT.set(sample.memory_percent);
        LIVE_TASKS.set(sample.tasks.min(i64::MAX as u64) as i64);

        let now = self.clock.now();
        let (target, reason) = determine_level(&self.config, &sample);

        let previous = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.last_sample = sample;
            state.sampled_at = Some(now);

            if target == state.level {
                return None;
            }
            if target < state.level && now - state.level_since < self.config.recovery_cooldown() {
                debug!(
                    "Holding throttle level {} (load allows {}) until cooldown passes",
                    state.level, target
                );
                return None;
            }

            let previous = state.level;
            state.level = target;
            state.level_since = now;
            previous
        };

        Some(self.record_transition(previous, target, sample, reason, false, now))
    }

    /// Force a level regardless of load
    pub fn manually_set_throttle(&self, level: ThrottleLevel, reason: &str) -> ThrottleEvent {
        let now = self.clock.now();
        let (previous, sample) = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            let previous = state.level;
            state.level = level;
            state.level_since = now;
            (previous, state.last_sample)
        };
        let reason = format!("Manual override (was {}): {}", previous, reason);
        self.record_transition(previous, level, sample, reason, true, now)
    }

    /// Newest first
    pub fn get_throttle_history(&self, limit: usize) -> Vec<ThrottleEvent> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().rev().take(limit).cloned().collect()
    }

    /// Summary of transitions created in the last `hours` hours
    pub fn get_throttle_stats(&self, hours: u32) -> ThrottleStats {
        let cutoff = self.clock.now() - Duration::hours(hours as i64);
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let recent: Vec<&ThrottleEvent> = history.iter().filter(|e| e.created_at >= cutoff).collect();

        let mut events_by_level = BTreeMap::new();
        for event in &recent {
            *events_by_level.entry(event.level.to_string()).or_insert(0) += 1;
        }
        let durations: Vec<i64> = recent.iter().filter_map(|e| e.duration_secs).collect();
        let average_duration_secs = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<i64>() as f64 / durations.len() as f64)
        };

        let current_level = self.get_current_level();
        ThrottleStats {
            window_hours: hours,
            total_events: recent.len(),
            manual_overrides: recent.iter().filter(|e| e.manual).count(),
            events_by_level,
            average_duration_secs,
            max_cpu_percent: recent.iter().map(|e| e.cpu_percent).fold(0.0, f64::max),
            max_memory_percent: recent.iter().map(|e| e.memory_percent).fold(0.0, f64::max),
            current_level,
            current_multiplier: self.config.multipliers.for_level(current_level),
        }
    }

    /// Stop the sampler; safe to call more than once
    pub fn close(&self) {
        if let Some(sampler) = &self.sampler {
            if sampler.stop() {
                info!("Auto-throttler stopped");
            }
        }
    }

    fn record_transition(
        &self,
        previous: ThrottleLevel,
        level: ThrottleLevel,
        sample: ResourceSample,
        reason: String,
        manual: bool,
        now: DateTime<Utc>,
    ) -> ThrottleEvent {
        let multiplier = self.config.multipliers.for_level(level);
        let event = ThrottleEvent {
            id: uuid::Uuid::new_v4().to_string(),
            level,
            previous_level: previous,
            cpu_percent: sample.cpu_percent,
            memory_percent: sample.memory_percent,
            tasks: sample.tasks,
            multiplier,
            reason,
            manual,
            created_at: now,
            resolved_at: None,
            duration_secs: None,
        };

        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(open) = history.back_mut().filter(|e| e.resolved_at.is_none()) {
                open.resolved_at = Some(now);
                open.duration_secs = Some((now - open.created_at).num_seconds());
            }
            history.push_back(event.clone());
            while history.len() > self.config.history_limit {
                history.pop_front();
            }
        }

        THROTTLE_LEVEL.set(level.as_i64());
        THROTTLE_MULTIPLIER.set(multiplier);

        if level > previous && level >= ThrottleLevel::High {
            warn!("Throttle escalated {} -> {}: {}", previous, level, event.reason);
        } else {
            info!("Throttle level {} -> {}: {}", previous, level, event.reason);
        }
        self.notify(&event);
        event
    }

    fn notify(&self, event: &ThrottleEvent) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let notification = if event.level > event.previous_level && event.level >= ThrottleLevel::High {
            let severity = if event.level == ThrottleLevel::Critical {
                Severity::Critical
            } else {
                Severity::Warning
            };
            Notification::new(
                NotificationKind::ThrottleEscalated,
                severity,
                &format!("Throttle level {}", event.level),
                &event.reason,
            )
        } else if event.level == ThrottleLevel::None && event.previous_level >= ThrottleLevel::High {
            Notification::new(
                NotificationKind::ThrottleCleared,
                Severity::Info,
                "Throttle cleared",
                &event.reason,
            )
        } else {
            return;
        };
        notifier.dispatch_in_background(notification.with_data(serde_json::json!({
            "level": event.level,
            "multiplier": event.multiplier,
            "cpu_percent": event.cpu_percent,
            "memory_percent": event.memory_percent,
            "tasks": event.tasks,
        })));
    }
}

impl Drop for AutoThrottler {
    fn drop(&mut self) {
        self.close();
    }
}
