//! Graceful degradation driven by backend health.
//!
//! The manager derives an operation mode from the connection manager's
//! health map and runs operations accordingly: primaries only while the
//! system is at least degraded, fallbacks in anything but emergency
//! mode. Failures accumulate in the result instead of propagating.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::config::BackendKind;
use crate::connections::{BackendStatus, ConnectionManager};
use crate::errors::ServiceError;
use crate::metrics::{Gauge, MetricsRegistry};

/// Operation modes, ordered from normal service to lockdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum OperationMode {
    FullOperation = 1,
    DegradedOperation = 2,
    ReadOnly = 3,
    Emergency = 4,
}

impl OperationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationMode::FullOperation => "full_operation",
            OperationMode::DegradedOperation => "degraded_operation",
            OperationMode::ReadOnly => "read_only",
            OperationMode::Emergency => "emergency",
        }
    }

    pub fn gauge_value(&self) -> f64 {
        *self as u8 as f64
    }

    fn allows_primary(&self) -> bool {
        matches!(
            self,
            OperationMode::FullOperation | OperationMode::DegradedOperation
        )
    }

    fn allows_fallback(&self) -> bool {
        *self != OperationMode::Emergency
    }
}

impl From<u8> for OperationMode {
    fn from(value: u8) -> Self {
        match value {
            2 => OperationMode::DegradedOperation,
            3 => OperationMode::ReadOnly,
            4 => OperationMode::Emergency,
            _ => OperationMode::FullOperation,
        }
    }
}

/// Outcome of a mode-aware operation.
#[derive(Debug)]
pub struct OperationResult<T> {
    pub success: bool,
    pub value: Option<T>,
    pub mode: OperationMode,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub fallback_used: bool,
}

impl<T> OperationResult<T> {
    fn failed(mode: OperationMode) -> Self {
        Self {
            success: false,
            value: None,
            mode,
            warnings: Vec::new(),
            errors: Vec::new(),
            fallback_used: false,
        }
    }
}

/// Runs operations with automatic fallback based on infrastructure
/// health.
pub struct DegradationManager {
    connections: Arc<ConnectionManager>,
    metrics: Arc<MetricsRegistry>,
    mode: AtomicU8,
    mode_gauge: Gauge,
}

impl DegradationManager {
    pub fn new(connections: Arc<ConnectionManager>, metrics: Arc<MetricsRegistry>) -> Self {
        metrics.describe(
            "operation_mode",
            "Current operation mode (1=full, 2=degraded, 3=read_only, 4=emergency)",
        );
        metrics.describe(
            "resilience_operations_total",
            "Operations executed through the degradation manager",
        );
        metrics.describe("resilience_fallbacks_total", "Fallback operations executed");
        let mode_gauge = metrics.gauge("operation_mode", &[]);
        mode_gauge.set(OperationMode::FullOperation.gauge_value());
        Self {
            connections,
            metrics,
            mode: AtomicU8::new(OperationMode::FullOperation as u8),
            mode_gauge,
        }
    }

    pub fn current_mode(&self) -> OperationMode {
        OperationMode::from(self.mode.load(Ordering::Acquire))
    }

    /// Re-derive the mode from backend statuses: all healthy gives full
    /// operation, >= 70 % usable degrades, >= 30 % turns read-only, and
    /// anything worse is an emergency.
    pub fn refresh_mode(&self) -> OperationMode {
        let statuses: Vec<BackendStatus> = self
            .connections
            .statuses()
            .into_iter()
            .filter(|(kind, _)| self.connections.is_registered(*kind))
            .map(|(_, status)| status)
            .collect();

        let total = statuses.len();
        let healthy = statuses
            .iter()
            .filter(|s| **s == BackendStatus::Healthy)
            .count();
        let degraded = statuses
            .iter()
            .filter(|s| **s == BackendStatus::Degraded)
            .count();

        let new_mode = if healthy == total {
            OperationMode::FullOperation
        } else if (healthy + degraded) as f64 >= total as f64 * 0.7 {
            OperationMode::DegradedOperation
        } else if (healthy + degraded) as f64 >= total as f64 * 0.3 {
            OperationMode::ReadOnly
        } else {
            OperationMode::Emergency
        };

        let previous = OperationMode::from(self.mode.swap(new_mode as u8, Ordering::AcqRel));
        if previous != new_mode {
            warn!(
                from = previous.as_str(),
                to = new_mode.as_str(),
                "operation mode changed"
            );
        }
        self.mode_gauge.set(new_mode.gauge_value());
        new_mode
    }

    /// Run an operation without a fallback.
    pub async fn execute<T, P, PF>(&self, name: &str, primary: P) -> OperationResult<T>
    where
        P: FnOnce() -> PF,
        PF: Future<Output = Result<T, ServiceError>>,
    {
        type Never<T> = fn() -> std::future::Ready<Result<T, ServiceError>>;
        self.run(name, primary, None::<Never<T>>).await
    }

    /// Run an operation, falling back when the primary fails or the mode
    /// forbids primaries.
    pub async fn execute_with_fallback<T, P, PF, F, FF>(
        &self,
        name: &str,
        primary: P,
        fallback: F,
    ) -> OperationResult<T>
    where
        P: FnOnce() -> PF,
        PF: Future<Output = Result<T, ServiceError>>,
        F: FnOnce() -> FF,
        FF: Future<Output = Result<T, ServiceError>>,
    {
        self.run(name, primary, Some(fallback)).await
    }

    async fn run<T, P, PF, F, FF>(
        &self,
        name: &str,
        primary: P,
        fallback: Option<F>,
    ) -> OperationResult<T>
    where
        P: FnOnce() -> PF,
        PF: Future<Output = Result<T, ServiceError>>,
        F: FnOnce() -> FF,
        FF: Future<Output = Result<T, ServiceError>>,
    {
        self.metrics
            .counter("resilience_operations_total", &[("operation", name)])
            .increment();

        let mode = self.refresh_mode();
        let mut result = OperationResult::failed(mode);

        if mode.allows_primary() {
            match primary().await {
                Ok(value) => {
                    result.success = true;
                    result.value = Some(value);
                    if mode == OperationMode::DegradedOperation {
                        result
                            .warnings
                            .push("operating in degraded mode due to infrastructure issues".into());
                    }
                    return result;
                }
                Err(err) => {
                    warn!(operation = name, error = %err, "primary operation failed");
                    result.errors.push(format!("primary operation failed: {}", err));
                }
            }
        }

        if let Some(fallback) = fallback {
            if mode.allows_fallback() {
                info!(operation = name, "attempting fallback");
                match fallback().await {
                    Ok(value) => {
                        result.success = true;
                        result.value = Some(value);
                        result.fallback_used = true;
                        result
                            .warnings
                            .push(format!("used fallback mechanism for {}", name));
                        self.metrics
                            .counter("resilience_fallbacks_total", &[("operation", name)])
                            .increment();
                        return result;
                    }
                    Err(err) => {
                        error!(operation = name, error = %err, "fallback operation failed");
                        result.errors.push(format!("fallback operation failed: {}", err));
                    }
                }
            }
        }

        match mode {
            OperationMode::Emergency => result
                .errors
                .push("system in emergency mode, operation blocked".into()),
            OperationMode::ReadOnly => result
                .errors
                .push("system in read-only mode, write operations blocked".into()),
            _ => {}
        }

        result
    }

    /// Resilience score over registered backends: healthy counts 100,
    /// degraded 50, anything else 0, averaged.
    pub fn resilience_score(&self) -> f64 {
        let statuses: Vec<BackendStatus> = self
            .connections
            .statuses()
            .into_iter()
            .filter(|(kind, _)| self.connections.is_registered(*kind))
            .map(|(_, status)| status)
            .collect();
        if statuses.is_empty() {
            return 0.0;
        }
        let score: f64 = statuses
            .iter()
            .map(|status| match status {
                BackendStatus::Healthy => 100.0,
                BackendStatus::Degraded => 50.0,
                _ => 0.0,
            })
            .sum::<f64>()
            / statuses.len() as f64;
        (score * 10.0).round() / 10.0
    }

    pub fn recommendations(&self) -> Vec<String> {
        let mut recommendations = Vec::new();
        let mut health: Vec<_> = self.connections.all_health().into_iter().collect();
        health.sort_by(|a, b| a.0.cmp(&b.0));

        for (backend, entry) in health {
            match entry.status {
                BackendStatus::Unhealthy => recommendations.push(format!(
                    "backend '{}' is unhealthy, check service logs and restart if needed",
                    backend
                )),
                BackendStatus::Degraded => recommendations.push(format!(
                    "backend '{}' is degraded, monitor performance and consider maintenance",
                    backend
                )),
                BackendStatus::Unknown => {
                    let registered = backend
                        .parse::<BackendKind>()
                        .map(|kind| self.connections.is_registered(kind))
                        .unwrap_or(false);
                    if registered {
                        recommendations.push(format!(
                            "backend '{}' has not been probed, check configuration and dependencies",
                            backend
                        ));
                    }
                }
                _ => {}
            }
        }

        match self.current_mode() {
            OperationMode::DegradedOperation => recommendations
                .push("system in degraded mode, non-critical features may be limited".into()),
            OperationMode::ReadOnly => {
                recommendations.push("system in read-only mode, write operations are blocked".into())
            }
            OperationMode::Emergency => {
                recommendations.push("system in emergency mode, immediate intervention required".into())
            }
            OperationMode::FullOperation => {}
        }

        recommendations
    }

    /// Full status report for operators.
    pub fn system_status(&self) -> Value {
        json!({
            "operation_mode": self.current_mode().as_str(),
            "infrastructure_health": self.connections.all_health(),
            "system_resilience": self.resilience_score(),
            "recommendations": self.recommendations(),
        })
    }
}
