// Webhook notification channel
//
// POSTs each notification as JSON with bounded retries

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::notifier::{Notification, NotificationKind, Notifier, NotifyError};
use crate::retry::{attempt_timeout, calculate_retry_delay, is_retryable_status, RetryConfig, RetryDecision};

/// Webhook endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookTarget {
    /// Unique channel name
    pub id: String,
    /// URL to POST notifications to
    pub url: String,
    /// Custom HTTP headers to include
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    /// Bearer token for authentication
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Notification kinds to forward; `*` forwards everything
    #[serde(default = "default_event_types")]
    pub event_types: Vec<String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_enabled() -> bool {
    true
}

fn default_event_types() -> Vec<String> {
    vec!["*".to_string()]
}

impl WebhookTarget {
    pub fn new(id: &str, url: &str) -> Self {
        Self {
            id: id.to_string(),
            url: url.to_string(),
            headers: None,
            auth_token: None,
            enabled: true,
            event_types: default_event_types(),
            retry: RetryConfig::default(),
        }
    }

    /// Check if this target wants a notification kind
    pub fn handles(&self, kind: NotificationKind) -> bool {
        self.enabled
            && self
                .event_types
                .iter()
                .any(|t| t == "*" || t == kind.as_str())
    }
}

/// Delivers notifications to one webhook target
#[derive(Debug)]
pub struct WebhookNotifier {
    target: WebhookTarget,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(target: WebhookTarget) -> Self {
        Self {
            target,
            client: reqwest::Client::new(),
        }
    }

    async fn attempt(&self, notification: &Notification, attempt: u32) -> Result<(), (NotifyError, bool)> {
        let timeout = attempt_timeout(attempt, Duration::from_secs(5));
        let mut request = self
            .client
            .post(&self.target.url)
            .timeout(timeout)
            .json(notification);

        if let Some(headers) = &self.target.headers {
            for (key, value) in headers {
                request = request.header(key, value);
            }
        }
        if let Some(token) = &self.target.auth_token {
            request = request.bearer_auth(token);
        }

        let start = Instant::now();
        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                debug!(
                    "Webhook {} attempt {} - status {}, time {} ms",
                    self.target.id,
                    attempt,
                    status,
                    start.elapsed().as_millis()
                );
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err((NotifyError::Status(status), is_retryable_status(status)))
                }
            }
            Err(e) => Err((NotifyError::Http(e.to_string()), true)),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        &self.target.id
    }

    fn handles(&self, kind: NotificationKind) -> bool {
        self.target.handles(kind)
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let mut attempt = 0;
        loop {
            match self.attempt(notification, attempt).await {
                Ok(()) => return Ok(()),
                Err((error, retryable)) => {
                    if !retryable {
                        return Err(error);
                    }
                    match calculate_retry_delay(attempt, &self.target.retry) {
                        RetryDecision::Retry(delay_ms) => {
                            warn!(
                                "Webhook {} attempt {} failed: {}, retrying in {} ms",
                                self.target.id, attempt, error, delay_ms
                            );
                            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                            attempt += 1;
                        }
                        RetryDecision::GiveUp => return Err(error),
                    }
                }
            }
        }
    }
}
