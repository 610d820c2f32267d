//! Notification delivery channels.
//!
//! Each channel is stateless aside from its configuration. Failures are
//! returned to the engine, which logs and counts them without letting
//! them interrupt evaluation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use serde_json::{json, Value};
use tracing::info;

use crate::alerting::{Alert, AlertStatus};
use crate::config::{ChatWebhookSettings, EmailSettings, PagingSettings, SmsSettings, WebhookSettings};
use crate::errors::ServiceError;
use crate::utils::time::unix_secs_f64;

const CHAT_ICON: &str = ":warning:";

/// A delivery channel for fired and resolved alerts.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, alert: &Alert) -> Result<(), ServiceError>;
}

fn format_timestamp(unix: f64) -> String {
    let secs = unix.trunc() as i64;
    let nanos = (unix.fract() * 1e9) as u32;
    match DateTime::from_timestamp(secs, nanos) {
        Some(ts) => ts.to_rfc3339(),
        None => format!("{:.3}", unix),
    }
}

/// Outgoing email produced by the email channel.
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub html_body: String,
}

/// Delivery backend for the email channel. Production hosts wire an
/// SMTP implementation; the default transport only logs.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), ServiceError>;
}

/// Transport that records the send in the log and drops the message.
pub struct LoggingEmailTransport;

#[async_trait]
impl EmailTransport for LoggingEmailTransport {
    async fn send(&self, message: &EmailMessage) -> Result<(), ServiceError> {
        info!(
            to = message.to.join(", "),
            subject = %message.subject,
            "email notification logged (no transport configured)"
        );
        Ok(())
    }
}

pub struct EmailChannel {
    settings: EmailSettings,
    transport: Arc<dyn EmailTransport>,
}

impl EmailChannel {
    pub fn new(settings: EmailSettings, transport: Arc<dyn EmailTransport>) -> Self {
        Self {
            settings,
            transport,
        }
    }

    fn build_message(&self, alert: &Alert) -> EmailMessage {
        let mut body = String::new();
        body.push_str("<html>\n<body>\n");
        body.push_str(&format!("<h2>Alert: {}</h2>\n", alert.rule_name));
        body.push_str(&format!(
            "<p><strong>Severity:</strong> {}</p>\n",
            alert.severity.as_str().to_uppercase()
        ));
        body.push_str(&format!(
            "<p><strong>Status:</strong> {}</p>\n",
            alert.status.as_str()
        ));
        body.push_str(&format!(
            "<p><strong>Started:</strong> {}</p>\n",
            format_timestamp(alert.started_at)
        ));
        if let Some(resolved_at) = alert.resolved_at {
            body.push_str(&format!(
                "<p><strong>Resolved:</strong> {}</p>\n",
                format_timestamp(resolved_at)
            ));
        }
        body.push_str(&format!(
            "<p><strong>Message:</strong> {}</p>\n",
            alert.message
        ));

        body.push_str("<h3>Labels:</h3>\n<ul>\n");
        let mut labels: Vec<_> = alert.labels.iter().collect();
        labels.sort();
        for (key, value) in labels {
            body.push_str(&format!("<li>{}: {}</li>\n", key, value));
        }
        body.push_str("</ul>\n<h3>Annotations:</h3>\n<ul>\n");
        let mut annotations: Vec<_> = alert.annotations.iter().collect();
        annotations.sort();
        for (key, value) in annotations {
            body.push_str(&format!("<li>{}: {}</li>\n", key, value));
        }
        body.push_str("</ul>\n</body>\n</html>\n");

        EmailMessage {
            from: self.settings.from.clone(),
            to: self.settings.to.clone(),
            subject: format!(
                "[{}] {}",
                alert.severity.as_str().to_uppercase(),
                alert.rule_name
            ),
            html_body: body,
        }
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &str {
        "email"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), ServiceError> {
        let message = self.build_message(alert);
        self.transport.send(&message).await?;
        info!(rule = %alert.rule_name, "email notification sent");
        Ok(())
    }
}

/// Chat webhook with Slack-compatible attachment payloads.
pub struct ChatWebhookChannel {
    settings: ChatWebhookSettings,
    service: String,
    client: reqwest::Client,
}

impl ChatWebhookChannel {
    pub fn new(settings: ChatWebhookSettings, service: &str) -> Self {
        Self {
            settings,
            service: service.to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn payload(&self, alert: &Alert) -> Value {
        json!({
            "channel": self.settings.channel,
            "username": self.settings.username,
            "icon_emoji": CHAT_ICON,
            "attachments": [{
                "color": alert.severity.color(),
                "title": format!("Alert: {}", alert.rule_name),
                "text": alert.message,
                "fields": [
                    {"title": "Severity", "value": alert.severity.as_str().to_uppercase(), "short": true},
                    {"title": "Status", "value": alert.status.as_str(), "short": true},
                    {"title": "Started", "value": format_timestamp(alert.started_at), "short": false},
                ],
                "footer": self.service,
                "ts": alert.started_at as i64,
            }],
        })
    }
}

#[async_trait]
impl NotificationChannel for ChatWebhookChannel {
    fn name(&self) -> &str {
        "chat"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), ServiceError> {
        self.client
            .post(&self.settings.webhook_url)
            .timeout(Duration::from_secs(10))
            .json(&self.payload(alert))
            .send()
            .await?
            .error_for_status()?;
        info!(rule = %alert.rule_name, "chat notification sent");
        Ok(())
    }
}

/// Generic JSON webhook carrying the full alert.
pub struct WebhookChannel {
    settings: WebhookSettings,
    service: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(settings: WebhookSettings, service: &str) -> Self {
        Self {
            settings,
            service: service.to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn payload(&self, alert: &Alert) -> Result<Value, ServiceError> {
        Ok(json!({
            "alert": serde_json::to_value(alert)?,
            "timestamp": format_timestamp(unix_secs_f64()),
            "service": self.service,
        }))
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), ServiceError> {
        let payload = self.payload(alert)?;
        self.client
            .post(&self.settings.url)
            .timeout(Duration::from_secs(30))
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        info!(rule = %alert.rule_name, "webhook notification sent");
        Ok(())
    }
}

/// Paging service channel speaking the events API v2 shape.
pub struct PagingChannel {
    settings: PagingSettings,
    service: String,
    client: reqwest::Client,
}

impl PagingChannel {
    pub fn new(settings: PagingSettings, service: &str) -> Self {
        Self {
            settings,
            service: service.to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn payload(&self, alert: &Alert) -> Value {
        let event_action = if alert.status == AlertStatus::Resolved {
            "resolve"
        } else {
            "trigger"
        };
        json!({
            "routing_key": self.settings.routing_key,
            "event_action": event_action,
            "dedup_key": format!("{}_{}", self.service, alert.rule_name),
            "payload": {
                "summary": format!(
                    "{}: {}",
                    alert.severity.as_str().to_uppercase(),
                    alert.rule_name
                ),
                "source": self.service,
                "severity": alert.severity.as_str(),
                "custom_details": {
                    "message": alert.message,
                    "labels": alert.labels,
                    "annotations": alert.annotations,
                    "started_at": format_timestamp(alert.started_at),
                },
            },
        })
    }
}

#[async_trait]
impl NotificationChannel for PagingChannel {
    fn name(&self) -> &str {
        "paging"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), ServiceError> {
        self.client
            .post(&self.settings.api_url)
            .timeout(Duration::from_secs(30))
            .json(&self.payload(alert))
            .send()
            .await?
            .error_for_status()?;
        info!(rule = %alert.rule_name, "paging notification sent");
        Ok(())
    }
}

/// SMS channel. Gateway integration is left to hosts, delivery is
/// logged only.
pub struct SmsChannel {
    settings: SmsSettings,
}

impl SmsChannel {
    pub fn new(settings: SmsSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl NotificationChannel for SmsChannel {
    fn name(&self) -> &str {
        "sms"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), ServiceError> {
        info!(
            rule = %alert.rule_name,
            recipients = self.settings.numbers.len(),
            "sms notification logged (no gateway configured)"
        );
        Ok(())
    }
}
