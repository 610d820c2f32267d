//! Error taxonomy shared by every service linking this library.
//!
//! Errors are classified by category and severity rather than by a deep type
//! hierarchy. Each error carries an operator-facing message, a user-safe
//! message, a stable code, and a request context with a correlation id, so a
//! failure can be traced across service boundaries. Component boundaries
//! convert their internal failures into [`ServiceError`]; anything
//! unclassified wraps as `system`/`HIGH`.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

/// Failure classification used for routing, logging and HTTP mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    BusinessLogic,
    ExternalApi,
    Database,
    Network,
    Authentication,
    Authorization,
    RateLimited,
    DataConsistency,
    Configuration,
    System,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::BusinessLogic => "business_logic",
            ErrorCategory::ExternalApi => "external_api",
            ErrorCategory::Database => "database",
            ErrorCategory::Network => "network",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Authorization => "authorization",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::DataConsistency => "data_consistency",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::System => "system",
        }
    }

    /// Default severity applied when a constructor does not override it.
    fn default_severity(&self) -> ErrorSeverity {
        match self {
            ErrorCategory::Validation => ErrorSeverity::Low,
            ErrorCategory::BusinessLogic => ErrorSeverity::Medium,
            ErrorCategory::RateLimited => ErrorSeverity::Medium,
            ErrorCategory::Network => ErrorSeverity::Medium,
            ErrorCategory::ExternalApi => ErrorSeverity::High,
            ErrorCategory::Database => ErrorSeverity::High,
            ErrorCategory::Authentication => ErrorSeverity::High,
            ErrorCategory::Authorization => ErrorSeverity::High,
            ErrorCategory::DataConsistency => ErrorSeverity::High,
            ErrorCategory::Configuration => ErrorSeverity::High,
            ErrorCategory::System => ErrorSeverity::High,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How urgently an operator should care.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "LOW",
            ErrorSeverity::Medium => "MEDIUM",
            ErrorSeverity::High => "HIGH",
            ErrorSeverity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request-scoped context attached to an error as it crosses services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub extra: HashMap<String, Value>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            user_id: None,
            organization_id: None,
            order_id: None,
            symbol: None,
            endpoint: None,
            extra: HashMap::new(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_organization(mut self, org_id: impl Into<String>) -> Self {
        self.organization_id = Some(org_id.into());
        self
    }

    pub fn with_order(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Classified library error.
///
/// `message` is the developer-facing description; `user_message` is safe to
/// return to clients. `retry_after` is populated for rate-limit and
/// circuit-open failures so callers can surface a `Retry-After` header.
#[derive(Debug, Error)]
#[error("[{code}] {message}")]
pub struct ServiceError {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub code: String,
    pub message: String,
    pub user_message: String,
    pub retry_after: Option<Duration>,
    pub context: ErrorContext,
    status_override: Option<u16>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ServiceError {
    /// General constructor; prefer the named constructors below.
    pub fn new(category: ErrorCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            severity: category.default_severity(),
            code: code.into(),
            user_message: default_user_message(category),
            message,
            category,
            retry_after: None,
            context: ErrorContext::new(),
            status_override: None,
            source: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, "VALIDATION_ERROR", message)
    }

    pub fn business_logic(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::BusinessLogic, "BUSINESS_RULE_VIOLATION", message)
    }

    /// Entity lookup miss; maps to HTTP 404.
    pub fn not_found(entity: impl fmt::Display) -> Self {
        let mut err = Self::new(
            ErrorCategory::BusinessLogic,
            "NOT_FOUND",
            format!("{} not found", entity),
        );
        err.user_message = "The requested resource was not found".to_string();
        err.status_override = Some(404);
        err
    }

    pub fn external_api(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ExternalApi, "EXTERNAL_API_ERROR", message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Database, "DATABASE_ERROR", message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, "NETWORK_ERROR", message)
    }

    /// Operation exceeded its deadline. Counts as a network-class failure.
    pub fn timeout(operation: impl fmt::Display, after: Duration) -> Self {
        Self::new(
            ErrorCategory::Network,
            "TIMEOUT",
            format!("{} timed out after {:?}", operation, after),
        )
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Authentication, "AUTHENTICATION_FAILED", message)
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Authorization, "AUTHORIZATION_FAILED", message)
    }

    /// Rate limit exceeded; `retry_after` tells the caller when to come back.
    pub fn rate_limited(limiter: impl fmt::Display, retry_after: Option<Duration>) -> Self {
        let mut err = Self::new(
            ErrorCategory::RateLimited,
            "RATE_LIMIT_EXCEEDED",
            format!("rate limit exceeded for {}", limiter),
        );
        err.user_message = "Too many requests, please retry later".to_string();
        err.retry_after = retry_after;
        err
    }

    /// Circuit breaker rejected the call without invoking the operation.
    pub fn circuit_open(circuit: impl fmt::Display, retry_after: Option<Duration>) -> Self {
        let mut err = Self::new(
            ErrorCategory::ExternalApi,
            "CIRCUIT_OPEN",
            format!("circuit breaker '{}' is open", circuit),
        );
        err.user_message = "A downstream dependency is temporarily unavailable".to_string();
        err.retry_after = retry_after;
        err.severity = ErrorSeverity::High;
        err
    }

    pub fn data_consistency(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::DataConsistency, "DATA_CONSISTENCY_ERROR", message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Configuration, "CONFIGURATION_ERROR", message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::System, "SYSTEM_ERROR", message)
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_user_message(mut self, message: impl Into<String>) -> Self {
        self.user_message = message.into();
        self
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }

    /// HTTP status code implied by this error's category.
    pub fn http_status(&self) -> u16 {
        if let Some(status) = self.status_override {
            return status;
        }
        match self.category {
            ErrorCategory::Validation => 400,
            ErrorCategory::Authentication => 401,
            ErrorCategory::Authorization => 403,
            ErrorCategory::RateLimited => 429,
            ErrorCategory::ExternalApi => 502,
            ErrorCategory::Network => 503,
            _ => 500,
        }
    }

    /// Whether a retry policy should consider this error transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category,
            ErrorCategory::Network | ErrorCategory::ExternalApi | ErrorCategory::Database
        )
    }

    /// Response body served to clients; never leaks the developer message.
    pub fn to_response_value(&self) -> Value {
        let mut body = json!({
            "error": {
                "code": self.code,
                "message": self.user_message,
                "category": self.category.as_str(),
                "severity": self.severity.as_str(),
                "correlation_id": self.context.correlation_id,
            }
        });
        if let Some(retry_after) = self.retry_after {
            body["retry_after"] = json!(retry_after.as_secs());
        }
        body
    }
}

fn default_user_message(category: ErrorCategory) -> String {
    match category {
        ErrorCategory::Validation => "The request was invalid",
        ErrorCategory::BusinessLogic => "The operation could not be completed",
        ErrorCategory::Authentication => "Authentication failed",
        ErrorCategory::Authorization => "You are not allowed to perform this operation",
        ErrorCategory::RateLimited => "Too many requests, please retry later",
        ErrorCategory::ExternalApi | ErrorCategory::Network => {
            "A downstream dependency is temporarily unavailable"
        }
        _ => "An internal error occurred",
    }
    .to_string()
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        let base = match err.kind() {
            std::io::ErrorKind::TimedOut => {
                ServiceError::new(ErrorCategory::Network, "TIMEOUT", err.to_string())
            }
            _ => ServiceError::network(err.to_string()),
        };
        base.with_source(err)
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        let base = if err.is_timeout() {
            ServiceError::new(ErrorCategory::Network, "TIMEOUT", err.to_string())
        } else if err.is_connect() {
            ServiceError::network(err.to_string())
        } else {
            ServiceError::external_api(err.to_string())
        };
        base.with_source(err)
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::validation(err.to_string())
            .with_code("INVALID_PAYLOAD")
            .with_source(err)
    }
}

impl From<config::ConfigError> for ServiceError {
    fn from(err: config::ConfigError) -> Self {
        ServiceError::configuration(err.to_string()).with_source(err)
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        ServiceError::system(format!("{:#}", err)).with_severity(ErrorSeverity::High)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(ServiceError::validation("bad").http_status(), 400);
        assert_eq!(ServiceError::authentication("no").http_status(), 401);
        assert_eq!(ServiceError::authorization("no").http_status(), 403);
        assert_eq!(ServiceError::not_found("order 42").http_status(), 404);
        assert_eq!(ServiceError::rate_limited("api", None).http_status(), 429);
        assert_eq!(ServiceError::external_api("down").http_status(), 502);
        assert_eq!(ServiceError::network("down").http_status(), 503);
        assert_eq!(ServiceError::database("oops").http_status(), 500);
        assert_eq!(ServiceError::system("oops").http_status(), 500);
    }

    #[test]
    fn test_default_severities() {
        assert_eq!(ServiceError::validation("x").severity, ErrorSeverity::Low);
        assert_eq!(ServiceError::database("x").severity, ErrorSeverity::High);
        assert_eq!(
            ServiceError::business_logic("x").severity,
            ErrorSeverity::Medium
        );
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ErrorSeverity::Low < ErrorSeverity::Medium);
        assert!(ErrorSeverity::Medium < ErrorSeverity::High);
        assert!(ErrorSeverity::High < ErrorSeverity::Critical);
    }

    #[test]
    fn test_response_body_uses_user_message() {
        let err = ServiceError::database("connection pool exhausted on node 3");
        let body = err.to_response_value();
        let message = body["error"]["message"].as_str().unwrap();
        assert!(!message.contains("pool"));
        assert_eq!(body["error"]["code"], "DATABASE_ERROR");
        assert_eq!(body["error"]["category"], "database");
        assert!(body["error"]["correlation_id"].as_str().unwrap().len() > 10);
    }

    #[test]
    fn test_retry_after_in_response() {
        let err = ServiceError::rate_limited("api_requests", Some(Duration::from_secs(30)));
        let body = err.to_response_value();
        assert_eq!(body["retry_after"], 30);
        assert_eq!(err.http_status(), 429);
    }

    #[test]
    fn test_circuit_open_is_retryable_dependency_failure() {
        let err = ServiceError::circuit_open("database", Some(Duration::from_secs(10)));
        assert_eq!(err.http_status(), 502);
        assert_eq!(err.code, "CIRCUIT_OPEN");
        assert!(err.is_retryable());
        assert_eq!(err.retry_after, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_io_timeout_classification() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline");
        let err: ServiceError = io.into();
        assert_eq!(err.category, ErrorCategory::Network);
        assert_eq!(err.code, "TIMEOUT");
    }

    #[test]
    fn test_unclassified_wraps_as_system_high() {
        let err: ServiceError = anyhow::anyhow!("something odd").into();
        assert_eq!(err.category, ErrorCategory::System);
        assert_eq!(err.severity, ErrorSeverity::High);
    }

    #[test]
    fn test_context_builder() {
        let ctx = ErrorContext::new()
            .with_user("u-1")
            .with_symbol("AAPL")
            .with_extra("attempt", serde_json::json!(2));
        let err = ServiceError::validation("qty").with_context(ctx);
        assert_eq!(err.context.user_id.as_deref(), Some("u-1"));
        assert_eq!(err.context.symbol.as_deref(), Some("AAPL"));
        assert_eq!(err.context.extra["attempt"], 2);
    }

    #[test]
    fn test_display_format() {
        let err = ServiceError::validation("quantity must be positive");
        let shown = format!("{}", err);
        assert!(shown.contains("VALIDATION_ERROR"));
        assert!(shown.contains("quantity must be positive"));
    }
}
