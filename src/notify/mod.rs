// Operator notifications
//
// Handles:
// - Alerts when a user drops into the flagged tier
// - Alerts when the auto-throttler escalates to high or critical
// - Fan-out to log, in-memory dashboard feed and webhook channels

pub mod notifier;
pub mod webhook;

pub use notifier::{
    DashboardNotifier, LogNotifier, Notification, NotificationKind, Notifier, NotifierRegistry,
    NotifyConfig, NotifyError, Severity,
};
pub use webhook::{WebhookNotifier, WebhookTarget};
