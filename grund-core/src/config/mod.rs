//! Layered service configuration.
//!
//! Values resolve with precedence `private > service > common > environment >
//! defaults`: hard-coded defaults are seeded first, the documented override
//! variables (`{BACKEND}_URL`, `HEALTH_CHECK_INTERVAL`, `DEPLOYMENT_ENV`, ...)
//! sit above them, and the three YAML layers win over everything. Prefixed
//! variables (`GRUND__section__key`) join the environment layer.

pub mod types;

pub use types::*;

use anyhow::{Context, Result};
use config::{Config as ConfigLoader, ConfigBuilder, Environment, File};
use config::builder::DefaultState;
use std::path::Path;

const COMMON_FILE: &str = "common-config.yaml";
const PRIVATE_FILE: &str = "private-config.yaml";

impl Config {
    /// Load configuration for `service` from the layered YAML files in
    /// `config_dir`, with environment variable overrides.
    pub fn load<P: AsRef<Path>>(service: &str, config_dir: P) -> Result<Self> {
        let dir = config_dir.as_ref();

        let mut builder = ConfigLoader::builder()
            // Start with default values
            .set_default("service.name", service)?
            .set_default("service.deployment_env", "development")?
            .set_default("service.test_mode", false)?
            .set_default("service.use_mock_fallbacks", true)?
            .set_default("logging.level", "info")?
            .set_default("logging.json_logs", false)?
            .set_default("server.enabled", true)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 9090)?
            .set_default("connections.health_check_interval_secs", 30)?
            .set_default("connections.probe_timeout_secs", 5)?
            .set_default("connections.shutdown_grace_secs", 30)?
            .set_default("metrics.retention_secs", 3600)?
            .set_default("metrics.eviction_interval_secs", 3600)?
            .set_default("alerting.evaluation_interval_secs", 30)?
            .set_default("alerting.history_limit", 1000)?
            .set_default("alerting.default_rules", true)?
            .set_default("limits.warning_threshold", 0.8)?;

        // Documented override variables sit between defaults and the files
        builder = apply_env_layer(builder)?;

        let config = builder
            // Prefixed variables (GRUND__section__key) join the env layer
            .add_source(Environment::with_prefix("GRUND").separator("__"))
            // YAML layers, least to most specific
            .add_source(File::from(dir.join(COMMON_FILE)).required(false))
            .add_source(File::from(dir.join(format!("{}-config.yaml", service))).required(false))
            .add_source(File::from(dir.join(PRIVATE_FILE)).required(false))
            .build()
            .context("Failed to build configuration")?;

        let cfg: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Load from the default location (./config)
    pub fn load_default(service: &str) -> Result<Self> {
        Self::load(service, "config")
    }

    /// Minimal configuration for tests: testing environment, no required
    /// backends, operational server disabled.
    pub fn for_testing(service: &str) -> Self {
        let mut cfg = Self {
            service: ServiceSettings {
                name: service.to_string(),
                deployment_env: DeploymentEnv::Testing,
                test_mode: true,
                use_mock_fallbacks: true,
            },
            logging: LoggingSettings::default(),
            server: ServerSettings::default(),
            connections: ConnectionSettings::default(),
            metrics: MetricsSettings::default(),
            alerting: AlertingSettings::default(),
            rate_limits: Default::default(),
            limits: LimitSettings::default(),
        };
        cfg.server.enabled = false;
        cfg
    }

    /// Whether startup aborts on missing required backends are bypassed.
    pub fn test_mode(&self) -> bool {
        self.service.test_mode || self.service.deployment_env == DeploymentEnv::Testing
    }

    /// Settings for one backend, defaulted when the section is absent.
    pub fn backend_settings(&self, kind: BackendKind) -> BackendSettings {
        self.connections
            .backends
            .get(kind.as_str())
            .cloned()
            .unwrap_or_default()
    }

    /// Required classification: explicit override, else the deployment
    /// environment's required set.
    pub fn backend_required(&self, kind: BackendKind) -> bool {
        if let Some(settings) = self.connections.backends.get(kind.as_str()) {
            if let Some(required) = settings.required {
                return required;
            }
        }
        self.service.deployment_env.required_backends().contains(&kind)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.service.name.trim().is_empty() {
            anyhow::bail!("service.name must not be empty");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "Invalid log level '{}', must be one of: {:?}",
                self.logging.level,
                valid_log_levels
            );
        }

        if self.server.enabled && self.server.port == 0 {
            anyhow::bail!("server.port must be non-zero when the server is enabled");
        }

        if self.connections.health_check_interval_secs == 0 {
            anyhow::bail!("connections.health_check_interval_secs must be positive");
        }

        if self.connections.probe_timeout_secs == 0 {
            anyhow::bail!("connections.probe_timeout_secs must be positive");
        }

        for key in self.connections.backends.keys() {
            key.parse::<BackendKind>().map_err(|e| {
                anyhow::anyhow!("Invalid connections.backends entry: {}", e)
            })?;
        }

        if self.alerting.evaluation_interval_secs == 0 {
            anyhow::bail!("alerting.evaluation_interval_secs must be positive");
        }

        let valid_algorithms = ["sliding_window", "token_bucket", "fixed_window"];
        for (name, limit) in &self.rate_limits {
            if !valid_algorithms.contains(&limit.algorithm.as_str()) {
                anyhow::bail!(
                    "Invalid algorithm '{}' for rate limit '{}', must be one of: {:?}",
                    limit.algorithm,
                    name,
                    valid_algorithms
                );
            }
            if limit.max_requests == 0 {
                anyhow::bail!("Rate limit '{}' must allow at least one request", name);
            }
            if limit.window_secs == 0 {
                anyhow::bail!("Rate limit '{}' window must be positive", name);
            }
        }

        if self.limits.warning_threshold <= 0.0 || self.limits.warning_threshold > 1.0 {
            anyhow::bail!(
                "limits.warning_threshold must be in (0.0, 1.0], got {}",
                self.limits.warning_threshold
            );
        }

        Ok(())
    }
}

/// Seed the documented override variables as defaults so the YAML layers can
/// still win over them.
fn apply_env_layer(
    mut builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>> {
    if let Ok(v) = std::env::var("DEPLOYMENT_ENV") {
        builder = builder.set_default("service.deployment_env", v.to_ascii_lowercase())?;
    }
    if let Ok(v) = std::env::var("USE_MOCK_FALLBACKS") {
        builder = builder.set_default("service.use_mock_fallbacks", parse_bool(&v))?;
    }
    if let Ok(v) = std::env::var("HEALTH_CHECK_INTERVAL") {
        builder = builder.set_default("connections.health_check_interval_secs", v)?;
    }

    for kind in BackendKind::ALL {
        let prefix = kind.env_prefix();
        let section = format!("connections.backends.{}", kind.as_str());
        let fields = [
            ("url", "URL"),
            ("host", "HOST"),
            ("port", "PORT"),
            ("username", "USER"),
            ("password", "PASSWORD"),
            ("database", "DATABASE"),
            ("circuit_breaker_threshold", "CIRCUIT_BREAKER_THRESHOLD"),
            ("circuit_breaker_timeout_secs", "CIRCUIT_BREAKER_TIMEOUT"),
        ];
        for (field, suffix) in fields {
            if let Ok(v) = std::env::var(format!("{}_{}", prefix, suffix)) {
                builder = builder.set_default(format!("{}.{}", section, field), v)?;
            }
        }
    }

    Ok(builder)
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
