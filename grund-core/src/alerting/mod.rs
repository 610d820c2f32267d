//! Alerting engine
//!
//! Rules hold a condition in a restricted expression language evaluated
//! against the metric and health stores. Fired alerts move through
//! active, acknowledged, and resolved states, deduplicate per rule, and
//! fan out to pluggable notification channels with per-severity repeat
//! schedules.

pub mod condition;
pub mod engine;
pub mod notify;

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use condition::{EvalContext, Expr};
pub use engine::AlertEngine;
pub use notify::{
    ChatWebhookChannel, EmailChannel, EmailMessage, EmailTransport, LoggingEmailTransport,
    NotificationChannel, PagingChannel, SmsChannel, WebhookChannel,
};

/// Alert severity levels, ordered so repeat schedules can compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }

    /// Color used by chat channel attachments.
    pub fn color(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "#36a64f",
            AlertSeverity::Medium => "#ff9500",
            AlertSeverity::High => "#ff4500",
            AlertSeverity::Critical => "#ff0000",
        }
    }

    /// How long to wait between repeat notifications while active.
    pub fn repeat_interval(&self) -> Duration {
        match self {
            AlertSeverity::High | AlertSeverity::Critical => Duration::from_secs(30 * 60),
            _ => Duration::from_secs(60 * 60),
        }
    }
}

/// Alert lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
    Suppressed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
            AlertStatus::Suppressed => "suppressed",
        }
    }
}

/// Definition of an alert rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    pub description: String,
    pub condition: String,
    pub severity: AlertSeverity,
    pub evaluation_interval: Duration,
    pub for_duration: Duration,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub enabled: bool,
    /// Channel names to notify. Empty means every registered channel.
    pub channels: Vec<String>,
}

impl AlertRule {
    pub fn new(name: &str, condition: &str, severity: AlertSeverity) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            condition: condition.to_string(),
            severity,
            evaluation_interval: Duration::from_secs(30),
            for_duration: Duration::from_secs(300),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            enabled: true,
            channels: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_evaluation_interval(mut self, interval: Duration) -> Self {
        self.evaluation_interval = interval;
        self
    }

    pub fn with_for_duration(mut self, duration: Duration) -> Self {
        self.for_duration = duration;
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_channels(mut self, channels: &[&str]) -> Self {
        self.channels = channels.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A fired alert. Timestamps are unix seconds.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: String,
    pub rule_name: String,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub message: String,
    pub started_at: f64,
    pub resolved_at: Option<f64>,
    pub acknowledged_at: Option<f64>,
    pub acknowledged_by: Option<String>,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub notification_count: u32,
    pub last_notification_at: Option<f64>,
}

/// Default rules covering error rate, database health, response time,
/// and open circuit breakers.
pub fn default_rules(service: &str) -> Vec<AlertRule> {
    vec![
        AlertRule::new(
            "high_error_rate",
            "rate('trade_errors_total', 5) / rate('trade_api_requests_total', 5) > 0.05",
            AlertSeverity::High,
        )
        .with_description("Error rate exceeds 5% over 5 minutes")
        .with_evaluation_interval(Duration::from_secs(60))
        .with_for_duration(Duration::from_secs(300))
        .with_label("service", service)
        .with_label("type", "error_rate")
        .with_annotation("summary", "High error rate detected")
        .with_channels(&["chat", "email"]),
        AlertRule::new(
            "database_unhealthy",
            "not health('database')",
            AlertSeverity::Critical,
        )
        .with_description("Database health check failing")
        .with_evaluation_interval(Duration::from_secs(30))
        .with_for_duration(Duration::from_secs(60))
        .with_label("service", service)
        .with_label("component", "database")
        .with_annotation("summary", "Database is unhealthy")
        .with_channels(&["paging", "email"]),
        AlertRule::new(
            "high_response_time",
            "avg('trade_api_response_duration', 5) > 2000",
            AlertSeverity::Medium,
        )
        .with_description("API response time exceeds 2 seconds")
        .with_evaluation_interval(Duration::from_secs(60))
        .with_for_duration(Duration::from_secs(300))
        .with_label("service", service)
        .with_label("type", "performance")
        .with_annotation("summary", "High API response time")
        .with_channels(&["chat"]),
        AlertRule::new(
            "circuit_breaker_open",
            "metric('circuit_breaker_state') == 2",
            AlertSeverity::High,
        )
        .with_description("A circuit breaker is open")
        .with_evaluation_interval(Duration::from_secs(30))
        .with_for_duration(Duration::from_secs(60))
        .with_label("service", service)
        .with_label("type", "circuit_breaker")
        .with_annotation("summary", "Circuit breaker is open")
        .with_channels(&["chat", "email"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering_and_repeat_schedule() {
        assert!(AlertSeverity::Critical > AlertSeverity::High);
        assert!(AlertSeverity::High > AlertSeverity::Medium);
        assert!(AlertSeverity::Medium > AlertSeverity::Low);

        assert_eq!(
            AlertSeverity::High.repeat_interval(),
            Duration::from_secs(1800)
        );
        assert_eq!(
            AlertSeverity::Critical.repeat_interval(),
            Duration::from_secs(1800)
        );
        assert_eq!(
            AlertSeverity::Medium.repeat_interval(),
            Duration::from_secs(3600)
        );
        assert_eq!(
            AlertSeverity::Low.repeat_interval(),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_default_rules_parse() {
        let rules = default_rules("trade-api");
        assert_eq!(rules.len(), 4);
        for rule in &rules {
            assert!(
                Expr::parse(&rule.condition).is_ok(),
                "default rule '{}' must parse",
                rule.name
            );
            assert!(rule.enabled);
            assert_eq!(rule.labels.get("service"), Some(&"trade-api".to_string()));
        }
    }

    #[test]
    fn test_rule_builder() {
        let rule = AlertRule::new("custom", "metric('x') > 1", AlertSeverity::Low)
            .with_description("something")
            .with_for_duration(Duration::ZERO)
            .with_channels(&["email"])
            .disabled();
        assert_eq!(rule.for_duration, Duration::ZERO);
        assert!(!rule.enabled);
        assert_eq!(rule.channels, vec!["email".to_string()]);
    }
}
