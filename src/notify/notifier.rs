// Notification channels and the registry that fans out to them

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use super::webhook::{WebhookNotifier, WebhookTarget};

/// What happened
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ReputationFlagged,
    ThrottleEscalated,
    ThrottleCleared,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::ReputationFlagged => "reputation_flagged",
            NotificationKind::ThrottleEscalated => "throttle_escalated",
            NotificationKind::ThrottleCleared => "throttle_cleared",
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A single operator alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub kind: NotificationKind,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: NotificationKind, severity: Severity, title: &str, message: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            severity,
            title: title.to_string(),
            message: message.to_string(),
            data: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Endpoint returned status {0}")]
    Status(u16),
}

/// A delivery channel
#[async_trait]
pub trait Notifier: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Whether this channel wants `kind`
    fn handles(&self, _kind: NotificationKind) -> bool {
        true
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        match notification.severity {
            Severity::Critical => error!(
                kind = notification.kind.as_str(),
                "{}: {}", notification.title, notification.message
            ),
            Severity::Warning => warn!(
                kind = notification.kind.as_str(),
                "{}: {}", notification.title, notification.message
            ),
            Severity::Info => info!(
                kind = notification.kind.as_str(),
                "{}: {}", notification.title, notification.message
            ),
        }
        Ok(())
    }
}

/// Keeps the most recent notifications for the admin dashboard
#[derive(Debug)]
pub struct DashboardNotifier {
    capacity: usize,
    feed: Mutex<VecDeque<Notification>>,
}

impl DashboardNotifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            feed: Mutex::new(VecDeque::new()),
        }
    }

    /// Newest first
    pub fn recent(&self, limit: usize) -> Vec<Notification> {
        let feed = self.feed.lock().unwrap_or_else(|e| e.into_inner());
        feed.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.feed.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Notifier for DashboardNotifier {
    fn name(&self) -> &str {
        "dashboard"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let mut feed = self.feed.lock().unwrap_or_else(|e| e.into_inner());
        if feed.len() >= self.capacity {
            feed.pop_front();
        }
        feed.push_back(notification.clone());
        Ok(())
    }
}

/// Notification channel configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotifyConfig {
    /// Log every notification
    pub log: bool,
    /// Size of the in-memory dashboard feed; 0 disables it
    pub dashboard_capacity: usize,
    pub webhooks: Vec<WebhookTarget>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            log: true,
            dashboard_capacity: 100,
            webhooks: Vec::new(),
        }
    }
}

/// Named set of channels
///
/// Delivery failures are logged and never surface to the component that
/// raised the notification.
#[derive(Debug, Default)]
pub struct NotifierRegistry {
    notifiers: HashMap<String, Arc<dyn Notifier>>,
    dashboard: Option<Arc<DashboardNotifier>>,
}

impl NotifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the channels named in `config`
    pub fn from_config(config: &NotifyConfig) -> Self {
        let mut registry = Self::new();
        if config.log {
            registry.register(Arc::new(LogNotifier));
        }
        if config.dashboard_capacity > 0 {
            let dashboard = Arc::new(DashboardNotifier::new(config.dashboard_capacity));
            registry.dashboard = Some(dashboard.clone());
            registry.register(dashboard);
        }
        for target in config.webhooks.iter().filter(|t| t.enabled) {
            registry.register(Arc::new(WebhookNotifier::new(target.clone())));
        }
        registry
    }

    /// Add or replace a channel under its name
    pub fn register(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifiers.insert(notifier.name().to_string(), notifier);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.notifiers.keys().cloned().collect();
        names.sort();
        names
    }

    /// The dashboard feed, if configured
    pub fn dashboard(&self) -> Option<Arc<DashboardNotifier>> {
        self.dashboard.clone()
    }

    /// Deliver to every interested channel, returning how many succeeded
    pub async fn dispatch(&self, notification: &Notification) -> usize {
        let mut delivered = 0;
        for notifier in self.notifiers.values() {
            if !notifier.handles(notification.kind) {
                continue;
            }
            match notifier.send(notification).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    "Notifier '{}' failed to deliver {}: {}",
                    notifier.name(),
                    notification.id,
                    e
                ),
            }
        }
        debug!("Notification {} delivered to {} channel(s)", notification.id, delivered);
        delivered
    }

    /// Dispatch without blocking the caller
    pub fn dispatch_in_background(self: &Arc<Self>, notification: Notification) {
        let registry = self.clone();
        tokio::spawn(async move {
            registry.dispatch(&notification).await;
        });
    }
}
