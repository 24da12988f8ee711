//! Admission request and decision types, plus the HTTP contract a
//! middleware applies to a [`Decision`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::rules::Scope;

/// Identity and resource of one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitCheckRequest {
    pub system_id: String,
    pub scope: Scope,
    pub scope_value: String,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub request_path: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
}

impl LimitCheckRequest {
    pub fn new(system_id: &str, scope: Scope, scope_value: &str) -> Self {
        Self {
            system_id: system_id.to_string(),
            scope,
            scope_value: scope_value.to_string(),
            resource_type: None,
            request_path: None,
            method: None,
        }
    }

    pub fn with_resource_type(mut self, resource_type: &str) -> Self {
        self.resource_type = Some(resource_type.to_string()).filter(|r| !r.is_empty());
        self
    }

    pub fn with_route(mut self, method: &str, path: &str) -> Self {
        self.method = Some(method.to_string());
        self.request_path = Some(path.to_string());
        self
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    /// Rule that denied the request
    pub rule_id: Option<String>,
    pub reason: String,
    pub retry_after_seconds: u64,
    /// Limit of the most restrictive evaluated rule; 0 means unlimited
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: Option<DateTime<Utc>>,
}

impl Decision {
    /// Allowed with no applicable rule
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            rule_id: None,
            reason: "No matching rules".to_string(),
            retry_after_seconds: 0,
            limit: 0,
            remaining: 0,
            reset_time: None,
        }
    }

    /// Denied without a rule, used when a check fails closed
    pub fn fail_closed(retry_after_seconds: u64, reason: &str) -> Self {
        Self {
            allowed: false,
            rule_id: None,
            reason: reason.to_string(),
            retry_after_seconds,
            limit: 0,
            remaining: 0,
            reset_time: None,
        }
    }

    /// Allowed without evaluating rules, used when a check fails open
    pub fn fail_open(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
            ..Self::unlimited()
        }
    }

    /// Rate limit headers a middleware sets on every response
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
        ];
        if let Some(reset) = self.reset_time {
            headers.push(("X-RateLimit-Reset", reset.timestamp().to_string()));
        }
        if !self.allowed {
            headers.push(("Retry-After", self.retry_after_seconds.to_string()));
        }
        headers
    }

    /// JSON body of a 429 response, `None` when the request is allowed
    pub fn rejection_body(&self) -> Option<serde_json::Value> {
        if self.allowed {
            return None;
        }
        Some(serde_json::json!({
            "error": "rate_limit_exceeded",
            "message": self.reason,
            "limit": self.limit,
            "remaining": self.remaining,
            "retry_after_sec": self.retry_after_seconds,
        }))
    }
}

/// `floor(base × reputation multiplier × throttle multiplier)`
pub fn final_limit(base: u32, reputation_multiplier: f64, throttle_multiplier: f64) -> u32 {
    let scaled = base as f64 * reputation_multiplier * throttle_multiplier;
    if scaled.is_nan() || scaled <= 0.0 {
        0
    } else {
        scaled.floor().min(u32::MAX as f64) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_final_limit() {
        assert_eq!(final_limit(1000, 1.5, 0.6), 900);
        assert_eq!(final_limit(10, 0.75, 1.0), 7);
        assert_eq!(final_limit(10, 0.5, 0.2), 1);
        assert_eq!(final_limit(3, 0.5, 0.2), 0);
    }

    #[test]
    fn test_denied_headers_and_body() {
        let decision = Decision {
            allowed: false,
            rule_id: Some("r1".into()),
            reason: "Rate limit exceeded: per_second (6/5)".into(),
            retry_after_seconds: 2,
            limit: 5,
            remaining: 0,
            reset_time: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap()),
        };

        let headers = decision.headers();
        assert!(headers.contains(&("X-RateLimit-Limit", "5".to_string())));
        assert!(headers.contains(&("X-RateLimit-Remaining", "0".to_string())));
        assert!(headers.contains(&("X-RateLimit-Reset", "1704067201".to_string())));
        assert!(headers.contains(&("Retry-After", "2".to_string())));

        let body = decision.rejection_body().unwrap();
        assert_eq!(body["error"], "rate_limit_exceeded");
        assert_eq!(body["retry_after_sec"], 2);
        assert_eq!(body["limit"], 5);
    }

    #[test]
    fn test_allowed_has_no_retry_after() {
        let decision = Decision::unlimited();
        assert!(decision.rejection_body().is_none());
        assert!(!decision.headers().iter().any(|(name, _)| *name == "Retry-After"));
    }

    #[test]
    fn test_request_builder_drops_empty_resource() {
        let req = LimitCheckRequest::new("sys", Scope::Ip, "1.1.1.1").with_resource_type("");
        assert!(req.resource_type.is_none());
    }
}
