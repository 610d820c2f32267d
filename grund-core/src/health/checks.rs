//! Built-in health checks for common dependencies.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use crate::connections::backends::{KvStore, RelationalStore};
use crate::errors::ServiceError;
use crate::health::{CheckOutcome, HealthCheck, HealthStatus};
use crate::metrics::MetricsRegistry;

/// Relational database probe: runs a trivial query and inspects pool
/// pressure.
pub struct RelationalHealthCheck {
    store: Arc<dyn RelationalStore>,
    timeout: Duration,
}

impl RelationalHealthCheck {
    pub fn new(store: Arc<dyn RelationalStore>) -> Self {
        Self {
            store,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl HealthCheck for RelationalHealthCheck {
    fn name(&self) -> &str {
        "database"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn execute(&self) -> Result<CheckOutcome, ServiceError> {
        let started = Instant::now();
        self.store.query("SELECT 1").await?;
        let query_ms = started.elapsed().as_secs_f64() * 1000.0;

        let pool = self.store.pool_status();
        let utilization = pool.as_ref().map(|p| p.utilization()).unwrap_or(0.0);

        let (status, message) = if query_ms > 1000.0 {
            (
                HealthStatus::Degraded,
                format!("database responding slowly ({:.1}ms)", query_ms),
            )
        } else if utilization > 0.8 {
            (
                HealthStatus::Degraded,
                "database connection pool utilization high".to_string(),
            )
        } else {
            (
                HealthStatus::Healthy,
                format!("database healthy ({:.1}ms)", query_ms),
            )
        };

        let mut details = json!({ "query_time_ms": query_ms });
        if let Some(pool) = pool {
            details["pool"] = json!({
                "size": pool.size,
                "in_use": pool.in_use,
                "utilization": utilization,
            });
        }

        Ok(CheckOutcome::new(status, message).with_details(details))
    }
}

/// Key-value store probe: pings and inspects latency and memory
/// pressure.
pub struct KvHealthCheck {
    store: Arc<dyn KvStore>,
    timeout: Duration,
}

impl KvHealthCheck {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl HealthCheck for KvHealthCheck {
    fn name(&self) -> &str {
        "cache"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn execute(&self) -> Result<CheckOutcome, ServiceError> {
        let started = Instant::now();
        self.store.ping().await?;
        let ping_ms = started.elapsed().as_secs_f64() * 1000.0;

        let pressure = self.store.memory_pressure().await?.unwrap_or(0.0);

        let (status, message) = if ping_ms > 500.0 {
            (
                HealthStatus::Degraded,
                format!("key-value store responding slowly ({:.1}ms)", ping_ms),
            )
        } else if pressure > 0.9 {
            (
                HealthStatus::Degraded,
                format!("key-value store memory usage high ({:.1}%)", pressure * 100.0),
            )
        } else {
            (
                HealthStatus::Healthy,
                format!("key-value store healthy ({:.1}ms)", ping_ms),
            )
        };

        Ok(CheckOutcome::new(status, message).with_details(json!({
            "ping_time_ms": ping_ms,
            "memory_usage_percent": pressure * 100.0,
        })))
    }
}

/// External HTTP endpoint probe.
pub struct ExternalApiHealthCheck {
    name: String,
    url: String,
    expected_status: u16,
    client: reqwest::Client,
    timeout: Duration,
}

impl ExternalApiHealthCheck {
    pub fn new(name: &str, url: impl Into<String>) -> Self {
        Self {
            name: format!("external_api_{}", name),
            url: url.into(),
            expected_status: 200,
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn expecting_status(mut self, status: u16) -> Self {
        self.expected_status = status;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl HealthCheck for ExternalApiHealthCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn execute(&self) -> Result<CheckOutcome, ServiceError> {
        let started = Instant::now();
        let response = self.client.get(&self.url).send().await?;
        let response_ms = started.elapsed().as_secs_f64() * 1000.0;
        let code = response.status().as_u16();

        let (status, message) = if code == self.expected_status {
            if response_ms > 5000.0 {
                (
                    HealthStatus::Degraded,
                    format!("api responding slowly ({:.1}ms)", response_ms),
                )
            } else {
                (
                    HealthStatus::Healthy,
                    format!("api healthy ({:.1}ms)", response_ms),
                )
            }
        } else {
            (
                HealthStatus::Unhealthy,
                format!(
                    "api returned status {} (expected {})",
                    code, self.expected_status
                ),
            )
        };

        Ok(CheckOutcome::new(status, message).with_details(json!({
            "url": self.url,
            "status_code": code,
            "response_time_ms": response_ms,
        })))
    }
}

/// Host resource probe over CPU load, memory, and disk.
pub struct SystemResourcesHealthCheck {
    timeout: Duration,
}

impl Default for SystemResourcesHealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemResourcesHealthCheck {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(2),
        }
    }
}

#[async_trait]
impl HealthCheck for SystemResourcesHealthCheck {
    fn name(&self) -> &str {
        "system_resources"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn execute(&self) -> Result<CheckOutcome, ServiceError> {
        let cpu = read_cpu_percent();
        let memory = read_memory_percent();
        let disk = read_disk_percent("/");

        if cpu.is_none() && memory.is_none() && disk.is_none() {
            return Ok(CheckOutcome::new(
                HealthStatus::Unknown,
                "could not read system resources on this platform",
            ));
        }

        let worst = [cpu, memory, disk]
            .iter()
            .flatten()
            .fold(0.0_f64, |acc, v| acc.max(*v));

        let (status, message) = if worst > 90.0 {
            (
                HealthStatus::Unhealthy,
                "system resources critically high".to_string(),
            )
        } else if worst > 80.0 {
            (
                HealthStatus::Degraded,
                "system resources elevated".to_string(),
            )
        } else {
            (HealthStatus::Healthy, "system resources normal".to_string())
        };

        Ok(CheckOutcome::new(status, message).with_details(json!({
            "cpu_percent": cpu,
            "memory_percent": memory,
            "disk_percent": disk,
        })))
    }
}

/// CPU utilization approximated from the 1-minute load average,
/// normalized by core count.
#[cfg(any(target_os = "linux", target_os = "macos"))]
fn read_cpu_percent() -> Option<f64> {
    let mut loads = [0.0_f64; 3];
    let rc = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
    if rc < 1 {
        return None;
    }
    let cores = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if cores < 1 {
        return None;
    }
    Some((loads[0] / cores as f64 * 100.0).min(100.0))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn read_cpu_percent() -> Option<f64> {
    None
}

#[cfg(target_os = "linux")]
fn read_memory_percent() -> Option<f64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total_kb = None;
    let mut available_kb = None;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = rest.trim().split_whitespace().next()?.parse::<f64>().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = rest.trim().split_whitespace().next()?.parse::<f64>().ok();
        }
    }
    let total = total_kb?;
    let available = available_kb?;
    if total <= 0.0 {
        return None;
    }
    Some((1.0 - available / total) * 100.0)
}

#[cfg(not(target_os = "linux"))]
fn read_memory_percent() -> Option<f64> {
    None
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn read_disk_percent(path: &str) -> Option<f64> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;

    let path = CString::new(path).ok()?;
    let mut stats: MaybeUninit<libc::statvfs> = MaybeUninit::uninit();
    let rc = unsafe { libc::statvfs(path.as_ptr(), stats.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    let stats = unsafe { stats.assume_init() };
    if stats.f_blocks == 0 {
        return None;
    }
    let used = stats.f_blocks.saturating_sub(stats.f_bavail);
    Some(used as f64 / stats.f_blocks as f64 * 100.0)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn read_disk_percent(_path: &str) -> Option<f64> {
    None
}

/// Application probe: required environment variables and the recent
/// error rate from the metrics registry.
pub struct ApplicationHealthCheck {
    required_env: Vec<String>,
    metrics: Arc<MetricsRegistry>,
    error_rate_window: Duration,
    timeout: Duration,
}

impl ApplicationHealthCheck {
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            required_env: Vec::new(),
            metrics,
            error_rate_window: Duration::from_secs(300),
            timeout: Duration::from_secs(3),
        }
    }

    pub fn require_env(mut self, vars: &[&str]) -> Self {
        self.required_env = vars.iter().map(|v| v.to_string()).collect();
        self
    }

    fn error_rate(&self) -> f64 {
        let errors = self
            .metrics
            .rate("trade_errors_total", self.error_rate_window, &[]);
        let requests = self
            .metrics
            .rate("trade_api_requests_total", self.error_rate_window, &[]);
        if requests > 0.0 {
            errors / requests
        } else {
            0.0
        }
    }
}

#[async_trait]
impl HealthCheck for ApplicationHealthCheck {
    fn name(&self) -> &str {
        "application"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn execute(&self) -> Result<CheckOutcome, ServiceError> {
        let missing: Vec<&str> = self
            .required_env
            .iter()
            .filter(|var| std::env::var(var).is_err())
            .map(|var| var.as_str())
            .collect();

        if !missing.is_empty() {
            return Ok(CheckOutcome::new(
                HealthStatus::Unhealthy,
                format!("missing environment variables: {}", missing.join(", ")),
            )
            .with_details(json!({ "missing": missing })));
        }

        let error_rate = self.error_rate();
        let (status, message) = if error_rate > 0.1 {
            (
                HealthStatus::Degraded,
                format!("high error rate ({:.1}%)", error_rate * 100.0),
            )
        } else {
            (HealthStatus::Healthy, "application healthy".to_string())
        };

        Ok(CheckOutcome::new(status, message).with_details(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "error_rate": error_rate,
        })))
    }
}
