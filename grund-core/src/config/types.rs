use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub service: ServiceSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub connections: ConnectionSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
    #[serde(default)]
    pub alerting: AlertingSettings,
    /// Extra rate limiters beyond the built-in set, keyed by limiter name
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitSettings>,
    #[serde(default)]
    pub limits: LimitSettings,
}

/// Service identity and deployment environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Service name, used in metric tags and log fields
    pub name: String,

    /// Deployment environment; selects the required-backend set
    #[serde(default)]
    pub deployment_env: DeploymentEnv,

    /// Skip the abort on missing required backends (integration tests)
    #[serde(default)]
    pub test_mode: bool,

    /// Serve in-memory fallbacks when a backend is unreachable
    #[serde(default = "default_true")]
    pub use_mock_fallbacks: bool,
}

/// Deployment environments recognised in `DEPLOYMENT_ENV`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentEnv {
    #[default]
    Development,
    Staging,
    Production,
    Testing,
    /// Relational store only, for constrained deployments
    Minimal,
    /// Every backend required
    Full,
}

impl DeploymentEnv {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentEnv::Development => "development",
            DeploymentEnv::Staging => "staging",
            DeploymentEnv::Production => "production",
            DeploymentEnv::Testing => "testing",
            DeploymentEnv::Minimal => "minimal",
            DeploymentEnv::Full => "full",
        }
    }

    /// Backends that must come up before the service is allowed to start.
    pub fn required_backends(&self) -> &'static [BackendKind] {
        match self {
            DeploymentEnv::Development | DeploymentEnv::Minimal => &[BackendKind::Relational],
            DeploymentEnv::Staging | DeploymentEnv::Production => {
                &[BackendKind::Relational, BackendKind::KeyValue]
            }
            DeploymentEnv::Full => &[
                BackendKind::Relational,
                BackendKind::KeyValue,
                BackendKind::Broker,
                BackendKind::Document,
            ],
            DeploymentEnv::Testing => &[],
        }
    }
}

impl fmt::Display for DeploymentEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentEnv {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" => Ok(DeploymentEnv::Development),
            "staging" => Ok(DeploymentEnv::Staging),
            "production" => Ok(DeploymentEnv::Production),
            "testing" => Ok(DeploymentEnv::Testing),
            "minimal" => Ok(DeploymentEnv::Minimal),
            "full" => Ok(DeploymentEnv::Full),
            other => Err(format!("unknown deployment environment '{}'", other)),
        }
    }
}

/// The backend families the connection manager knows how to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Relational,
    #[serde(rename = "kv")]
    KeyValue,
    Broker,
    Document,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Relational,
        BackendKind::KeyValue,
        BackendKind::Broker,
        BackendKind::Document,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Relational => "relational",
            BackendKind::KeyValue => "kv",
            BackendKind::Broker => "broker",
            BackendKind::Document => "document",
        }
    }

    /// Prefix for the backend's environment override variables
    pub fn env_prefix(&self) -> &'static str {
        match self {
            BackendKind::Relational => "RELATIONAL",
            BackendKind::KeyValue => "KV",
            BackendKind::Broker => "BROKER",
            BackendKind::Document => "DOCUMENT",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "relational" => Ok(BackendKind::Relational),
            "kv" => Ok(BackendKind::KeyValue),
            "broker" => Ok(BackendKind::Broker),
            "document" => Ok(BackendKind::Document),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub json_logs: bool,
}

/// Operational HTTP server (health + metrics endpoints)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,

    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

/// Connection manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Seconds between background health probes
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,

    /// Per-backend probe timeout during startup and health checks
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Grace period for background loops to drain on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Per-backend settings, keyed by backend name ("relational", "kv", ...)
    #[serde(default)]
    pub backends: HashMap<String, BackendSettings>,
}

/// Per-backend connection settings; all fields optional so environment
/// variables and deployment-env defaults can fill the gaps
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Full connection URL; wins over the host/port fields
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub database: Option<String>,

    /// Overrides the deployment-env required classification
    #[serde(default)]
    pub required: Option<bool>,

    /// Probe latency above this marks the backend DEGRADED
    #[serde(default)]
    pub slow_threshold_ms: Option<u64>,

    /// Circuit breaker failure threshold for this backend
    #[serde(default)]
    pub circuit_breaker_threshold: Option<u32>,

    /// Circuit breaker recovery timeout in seconds
    #[serde(default)]
    pub circuit_breaker_timeout_secs: Option<u64>,
}

/// Metrics registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// How long metric points are retained before eviction
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// Cadence of the background eviction task
    #[serde(default = "default_retention")]
    pub eviction_interval_secs: u64,
}

/// Alert engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertingSettings {
    /// Cadence of the evaluation loop
    #[serde(default = "default_alert_interval")]
    pub evaluation_interval_secs: u64,

    /// Bounded alert history length
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Install the default rule set on startup
    #[serde(default = "default_true")]
    pub default_rules: bool,

    #[serde(default)]
    pub channels: ChannelSettings,
}

/// Delivery channel configuration; a channel is active when its section is set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelSettings {
    #[serde(default)]
    pub email: Option<EmailSettings>,

    #[serde(default)]
    pub chat: Option<ChatWebhookSettings>,

    #[serde(default)]
    pub webhook: Option<WebhookSettings>,

    #[serde(default)]
    pub paging: Option<PagingSettings>,

    #[serde(default)]
    pub sms: Option<SmsSettings>,
}

/// Email channel; delivery goes through a pluggable transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSettings {
    pub from: String,
    pub to: Vec<String>,
}

/// Chat webhook channel (Slack-compatible attachment payload)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatWebhookSettings {
    pub webhook_url: String,

    #[serde(default = "default_chat_channel")]
    pub channel: String,

    #[serde(default = "default_chat_username")]
    pub username: String,
}

/// Plain JSON webhook channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    pub url: String,
}

/// Paging service channel (events API v2 shape)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagingSettings {
    pub routing_key: String,

    #[serde(default = "default_paging_url")]
    pub api_url: String,
}

/// SMS channel; the gateway call is left to hosts, numbers are logged
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsSettings {
    pub numbers: Vec<String>,
}

/// Rate limiter definition loaded from config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// "sliding_window", "token_bucket" or "fixed_window"
    pub algorithm: String,

    pub max_requests: u64,

    pub window_secs: u64,

    /// Token bucket capacity; defaults to max_requests
    #[serde(default)]
    pub burst_size: Option<u64>,
}

/// Trading-limit validator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Fraction of a limit at which warnings start (0.0 to 1.0)
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_server_enabled() -> bool {
    true
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    9090
}

fn default_health_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_retention() -> u64 {
    3600
}

fn default_alert_interval() -> u64 {
    30
}

fn default_history_limit() -> usize {
    1000
}

fn default_chat_channel() -> String {
    "#alerts".to_string()
}

fn default_chat_username() -> String {
    "alert-bot".to_string()
}

fn default_paging_url() -> String {
    "https://events.pagerduty.com/v2/enqueue".to_string()
}

fn default_warning_threshold() -> f64 {
    0.8
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_logs: false,
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: default_server_enabled(),
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_interval(),
            probe_timeout_secs: default_probe_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
            backends: HashMap::new(),
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            retention_secs: default_retention(),
            eviction_interval_secs: default_retention(),
        }
    }
}

impl Default for AlertingSettings {
    fn default() -> Self {
        Self {
            evaluation_interval_secs: default_alert_interval(),
            history_limit: default_history_limit(),
            default_rules: true,
            channels: ChannelSettings::default(),
        }
    }
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            warning_threshold: default_warning_threshold(),
        }
    }
}
