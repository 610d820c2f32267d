//! Health checking for service dependencies
//!
//! Named checks run concurrently with per-check timeouts and roll up
//! into an overall status. Results are cached briefly so hot endpoints
//! do not hammer the backends they are probing.

pub mod checks;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::errors::ServiceError;
use crate::utils::time::unix_secs_f64;

pub use checks::{
    ApplicationHealthCheck, ExternalApiHealthCheck, KvHealthCheck, RelationalHealthCheck,
    SystemResourcesHealthCheck,
};

const CACHE_TTL: Duration = Duration::from_secs(30);

/// Component status levels, ordered from best to worst so the overall
/// status is the maximum over components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unknown,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unknown => "unknown",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    /// Whether a service reporting this status should keep serving
    /// traffic.
    pub fn is_serving(&self) -> bool {
        *self != HealthStatus::Unhealthy
    }
}

/// What a check reports about its component.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub status: HealthStatus,
    pub message: String,
    pub details: Option<Value>,
}

impl CheckOutcome {
    pub fn new(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Timed result of one component check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub component: String,
    pub status: HealthStatus,
    pub message: String,
    pub latency_ms: f64,
    pub timestamp: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregated result over every registered check.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub overall_status: HealthStatus,
    pub components: Vec<CheckResult>,
    pub timestamp: f64,
    pub response_time_ms: f64,
    pub system_info: Value,
}

impl SystemHealth {
    pub fn component_status(&self, name: &str) -> Option<HealthStatus> {
        self.components
            .iter()
            .find(|c| c.component == name)
            .map(|c| c.status)
    }

    pub fn statuses(&self) -> HashMap<String, HealthStatus> {
        self.components
            .iter()
            .map(|c| (c.component.clone(), c.status))
            .collect()
    }
}

/// A named health check with its own time budget.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    fn timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    async fn execute(&self) -> Result<CheckOutcome, ServiceError>;
}

async fn run_check(check: Arc<dyn HealthCheck>) -> CheckResult {
    let name = check.name().to_string();
    let budget = check.timeout();
    let started = Instant::now();

    match tokio::time::timeout(budget, check.execute()).await {
        Ok(Ok(outcome)) => {
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            debug!(
                component = %name,
                status = outcome.status.as_str(),
                latency_ms,
                "health check completed"
            );
            CheckResult {
                component: name,
                status: outcome.status,
                message: outcome.message,
                latency_ms,
                timestamp: unix_secs_f64(),
                details: outcome.details,
                error: None,
            }
        }
        Ok(Err(err)) => {
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            CheckResult {
                component: name,
                status: HealthStatus::Unhealthy,
                message: format!("health check failed: {}", err),
                latency_ms,
                timestamp: unix_secs_f64(),
                details: None,
                error: Some(err.to_string()),
            }
        }
        Err(_) => CheckResult {
            component: name,
            status: HealthStatus::Unhealthy,
            message: format!("health check timed out after {}s", budget.as_secs_f64()),
            latency_ms: budget.as_secs_f64() * 1000.0,
            timestamp: unix_secs_f64(),
            details: None,
            error: Some("timeout".into()),
        },
    }
}

/// Runs registered checks concurrently and caches the aggregate.
pub struct HealthRegistry {
    checks: RwLock<Vec<Arc<dyn HealthCheck>>>,
    cache: Mutex<Option<(Instant, SystemHealth)>>,
    cache_ttl: Duration,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            checks: RwLock::new(Vec::new()),
            cache: Mutex::new(None),
            cache_ttl: CACHE_TTL,
        }
    }

    #[cfg(test)]
    fn with_cache_ttl(ttl: Duration) -> Self {
        Self {
            checks: RwLock::new(Vec::new()),
            cache: Mutex::new(None),
            cache_ttl: ttl,
        }
    }

    pub fn add_check(&self, check: Arc<dyn HealthCheck>) {
        info!(component = check.name(), "health check registered");
        self.checks.write().push(check);
    }

    pub fn check_names(&self) -> Vec<String> {
        self.checks
            .read()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Run every check and aggregate. With `use_cache` a recent result
    /// is returned without touching the backends.
    pub async fn check_all(&self, use_cache: bool) -> SystemHealth {
        if use_cache {
            if let Some((at, cached)) = self.cache.lock().as_ref() {
                if at.elapsed() < self.cache_ttl {
                    debug!("returning cached health results");
                    return cached.clone();
                }
            }
        }

        let checks: Vec<Arc<dyn HealthCheck>> = self.checks.read().clone();
        let started = Instant::now();

        let handles: Vec<_> = checks
            .iter()
            .map(|check| {
                let check = check.clone();
                tokio::spawn(run_check(check))
            })
            .collect();

        let mut components = Vec::with_capacity(handles.len());
        for (handle, check) in handles.into_iter().zip(checks.iter()) {
            match handle.await {
                Ok(result) => components.push(result),
                Err(err) => components.push(CheckResult {
                    component: check.name().to_string(),
                    status: HealthStatus::Unhealthy,
                    message: format!("health check failed: {}", err),
                    latency_ms: 0.0,
                    timestamp: unix_secs_f64(),
                    details: None,
                    error: Some(err.to_string()),
                }),
            }
        }

        let overall_status = components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Unknown);

        let health = SystemHealth {
            overall_status,
            components,
            timestamp: unix_secs_f64(),
            response_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            system_info: system_info(),
        };

        *self.cache.lock() = Some((Instant::now(), health.clone()));

        info!(
            overall_status = overall_status.as_str(),
            healthy_components = health
                .components
                .iter()
                .filter(|c| c.status == HealthStatus::Healthy)
                .count(),
            total_components = health.components.len(),
            "health check round completed"
        );

        health
    }

    /// Last aggregate, however stale. None before the first round.
    pub fn last_known(&self) -> Option<SystemHealth> {
        self.cache.lock().as_ref().map(|(_, health)| health.clone())
    }

    /// Run a single named check, bypassing the cache.
    pub async fn component_health(&self, name: &str) -> Option<CheckResult> {
        let check = self
            .checks
            .read()
            .iter()
            .find(|c| c.name() == name)
            .cloned()?;
        Some(run_check(check).await)
    }
}

fn system_info() -> Value {
    json!({
        "hostname": hostname(),
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "pid": std::process::id(),
        "version": env!("CARGO_PKG_VERSION"),
    })
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    } else {
        "unknown".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticCheck {
        name: String,
        status: HealthStatus,
        delay: Duration,
        budget: Duration,
        fail: bool,
        runs: AtomicUsize,
    }

    impl StaticCheck {
        fn new(name: &str, status: HealthStatus) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                status,
                delay: Duration::ZERO,
                budget: Duration::from_secs(5),
                fail: false,
                runs: AtomicUsize::new(0),
            })
        }

        fn slow(name: &str, delay: Duration, budget: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                status: HealthStatus::Healthy,
                delay,
                budget,
                fail: false,
                runs: AtomicUsize::new(0),
            })
        }

        fn failing(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                status: HealthStatus::Healthy,
                delay: Duration::ZERO,
                budget: Duration::from_secs(5),
                fail: true,
                runs: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl HealthCheck for StaticCheck {
        fn name(&self) -> &str {
            &self.name
        }

        fn timeout(&self) -> Duration {
            self.budget
        }

        async fn execute(&self) -> Result<CheckOutcome, ServiceError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(ServiceError::database("probe refused"));
            }
            Ok(CheckOutcome::new(self.status, "ok"))
        }
    }

    #[tokio::test]
    async fn test_overall_is_worst_component() {
        let registry = HealthRegistry::new();
        registry.add_check(StaticCheck::new("a", HealthStatus::Healthy));
        registry.add_check(StaticCheck::new("b", HealthStatus::Degraded));

        let health = registry.check_all(false).await;
        assert_eq!(health.overall_status, HealthStatus::Degraded);

        registry.add_check(StaticCheck::new("c", HealthStatus::Unknown));
        let health = registry.check_all(false).await;
        assert_eq!(health.overall_status, HealthStatus::Unknown);

        registry.add_check(StaticCheck::new("d", HealthStatus::Unhealthy));
        let health = registry.check_all(false).await;
        assert_eq!(health.overall_status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_empty_registry_is_unknown() {
        let registry = HealthRegistry::new();
        let health = registry.check_all(false).await;
        assert_eq!(health.overall_status, HealthStatus::Unknown);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_marks_unhealthy_with_budget_latency() {
        let registry = HealthRegistry::new();
        registry.add_check(StaticCheck::slow(
            "slow",
            Duration::from_millis(200),
            Duration::from_millis(50),
        ));

        let health = registry.check_all(false).await;
        let result = &health.components[0];
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.latency_ms, 50.0);
        assert!(result.message.contains("timed out"));
        assert_eq!(result.error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_check_error_marks_unhealthy() {
        let registry = HealthRegistry::new();
        registry.add_check(StaticCheck::failing("broken"));

        let health = registry.check_all(false).await;
        let result = &health.components[0];
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert!(result.message.contains("health check failed"));
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_checks_run_concurrently() {
        let registry = HealthRegistry::new();
        for i in 0..4 {
            registry.add_check(StaticCheck::slow(
                &format!("c{}", i),
                Duration::from_millis(100),
                Duration::from_secs(1),
            ));
        }

        let started = Instant::now();
        let health = registry.check_all(false).await;
        // Serial execution would take 400ms.
        assert!(started.elapsed() < Duration::from_millis(350));
        assert_eq!(health.components.len(), 4);
        assert_eq!(health.overall_status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_cache_suppresses_reruns() {
        let registry = HealthRegistry::new();
        let check = StaticCheck::new("cached", HealthStatus::Healthy);
        registry.add_check(check.clone());

        registry.check_all(true).await;
        registry.check_all(true).await;
        assert_eq!(check.runs.load(Ordering::SeqCst), 1);

        registry.check_all(false).await;
        assert_eq!(check.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_expires() {
        let registry = HealthRegistry::with_cache_ttl(Duration::from_millis(20));
        let check = StaticCheck::new("expiring", HealthStatus::Healthy);
        registry.add_check(check.clone());

        registry.check_all(true).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        registry.check_all(true).await;
        assert_eq!(check.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_component_health_bypasses_cache() {
        let registry = HealthRegistry::new();
        registry.add_check(StaticCheck::new("db", HealthStatus::Degraded));

        let result = registry.component_health("db").await.unwrap();
        assert_eq!(result.status, HealthStatus::Degraded);
        assert!(registry.component_health("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_last_known_snapshot() {
        let registry = HealthRegistry::new();
        registry.add_check(StaticCheck::new("a", HealthStatus::Healthy));

        assert!(registry.last_known().is_none());
        registry.check_all(false).await;
        let snapshot = registry.last_known().unwrap();
        assert_eq!(snapshot.component_status("a"), Some(HealthStatus::Healthy));
        assert_eq!(
            snapshot.statuses().get("a"),
            Some(&HealthStatus::Healthy)
        );
    }

    #[test]
    fn test_status_ordering() {
        assert!(HealthStatus::Healthy < HealthStatus::Degraded);
        assert!(HealthStatus::Degraded < HealthStatus::Unknown);
        assert!(HealthStatus::Unknown < HealthStatus::Unhealthy);
        assert!(HealthStatus::Healthy.is_serving());
        assert!(!HealthStatus::Unhealthy.is_serving());
    }
}
