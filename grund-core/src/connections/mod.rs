//! Connection management for the backing stores.
//!
//! The manager owns one client slot per backend family, probes them
//! concurrently at startup, keeps probing in the background, and hands
//! clients out through per-backend circuit breakers. The key-value
//! getter can fall back to a shared in-memory store so callers keep
//! working through an outage.

pub mod backends;
pub mod memory;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{BackendKind, Config};
use crate::errors::ServiceError;
use crate::metrics::{Counter, Gauge, MetricsRegistry};
use crate::resilience::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
};
use crate::utils::time::unix_secs_f64;

use backends::{BackendResult, DocumentStore, KvStore, MessageBroker, RelationalStore};
use memory::{InMemoryBroker, InMemoryDocumentStore, InMemoryKv, InMemoryRelational};

/// Startup probe attempts for required backends.
const STARTUP_PROBE_ATTEMPTS: u32 = 3;
const STARTUP_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Health status levels for a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl BackendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendStatus::Healthy => "healthy",
            BackendStatus::Degraded => "degraded",
            BackendStatus::Unhealthy => "unhealthy",
            BackendStatus::Unknown => "unknown",
        }
    }

    /// Value reported on the `service_status` gauge.
    pub fn gauge_value(&self) -> f64 {
        match self {
            BackendStatus::Healthy => 1.0,
            BackendStatus::Degraded => 2.0,
            BackendStatus::Unhealthy => 3.0,
            BackendStatus::Unknown => 0.0,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, BackendStatus::Healthy | BackendStatus::Degraded)
    }
}

/// Health bookkeeping for one backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub status: BackendStatus,
    /// Unix seconds of the last probe.
    pub last_check: f64,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub latency_ms: Option<f64>,
    pub circuit_breaker_open: bool,
}

impl BackendHealth {
    fn unknown() -> Self {
        Self {
            status: BackendStatus::Unknown,
            last_check: unix_secs_f64(),
            error_count: 0,
            last_error: None,
            latency_ms: None,
            circuit_breaker_open: false,
        }
    }
}

/// One value per backend family.
struct PerBackend<T> {
    relational: T,
    kv: T,
    broker: T,
    document: T,
}

impl<T> PerBackend<T> {
    fn build(mut f: impl FnMut(BackendKind) -> T) -> Self {
        Self {
            relational: f(BackendKind::Relational),
            kv: f(BackendKind::KeyValue),
            broker: f(BackendKind::Broker),
            document: f(BackendKind::Document),
        }
    }

    fn get(&self, kind: BackendKind) -> &T {
        match kind {
            BackendKind::Relational => &self.relational,
            BackendKind::KeyValue => &self.kv,
            BackendKind::Broker => &self.broker,
            BackendKind::Document => &self.document,
        }
    }
}

/// Manages clients, probes, and breakers for all configured backends.
pub struct ConnectionManager {
    relational: RwLock<Option<Arc<dyn RelationalStore>>>,
    kv: RwLock<Option<Arc<dyn KvStore>>>,
    broker: RwLock<Option<Arc<dyn MessageBroker>>>,
    document: RwLock<Option<Arc<dyn DocumentStore>>>,

    fallback_kv: Arc<InMemoryKv>,
    breakers: PerBackend<Arc<CircuitBreaker>>,
    status_gauges: PerBackend<Gauge>,
    error_counters: PerBackend<Counter>,
    health_checks: Counter,
    health: RwLock<HashMap<BackendKind, BackendHealth>>,
    init_order: Mutex<Vec<BackendKind>>,
    shut_down: AtomicBool,

    required: Vec<BackendKind>,
    slow_thresholds: PerBackend<Duration>,
    probe_timeout: Duration,
    health_interval: Duration,
    shutdown_grace: Duration,
    use_mock_fallbacks: bool,
    test_mode: bool,
}

impl ConnectionManager {
    pub fn new(
        config: &Config,
        breaker_registry: &CircuitBreakerRegistry,
        metrics: &Arc<MetricsRegistry>,
    ) -> Self {
        metrics.describe(
            "service_status",
            "Backend status (1=healthy, 2=degraded, 3=unhealthy, 0=unknown)",
        );
        metrics.describe("connection_health_checks_total", "Background probe rounds");
        metrics.describe("connection_errors_total", "Backend probe failures");

        let breakers = PerBackend::build(|kind| {
            let settings = config.backend_settings(kind);
            let mut breaker_config = CircuitBreakerConfig::new(kind.as_str());
            if let Some(threshold) = settings.circuit_breaker_threshold {
                breaker_config.failure_threshold = threshold as u64;
            }
            if let Some(secs) = settings.circuit_breaker_timeout_secs {
                breaker_config.recovery_timeout = Duration::from_secs(secs);
            }
            breaker_registry.get_or_create_with(breaker_config)
        });

        let slow_thresholds = PerBackend::build(|kind| {
            let default_ms = match kind {
                BackendKind::KeyValue => 1_000,
                _ => 2_000,
            };
            Duration::from_millis(
                config
                    .backend_settings(kind)
                    .slow_threshold_ms
                    .unwrap_or(default_ms),
            )
        });

        let health = BackendKind::ALL
            .iter()
            .map(|kind| (*kind, BackendHealth::unknown()))
            .collect();

        Self {
            relational: RwLock::new(None),
            kv: RwLock::new(None),
            broker: RwLock::new(None),
            document: RwLock::new(None),
            fallback_kv: Arc::new(InMemoryKv::new()),
            breakers,
            status_gauges: PerBackend::build(|kind| {
                metrics.gauge("service_status", &[("backend", kind.as_str())])
            }),
            error_counters: PerBackend::build(|kind| {
                metrics.counter("connection_errors_total", &[("backend", kind.as_str())])
            }),
            health_checks: metrics.counter("connection_health_checks_total", &[]),
            health: RwLock::new(health),
            init_order: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
            required: BackendKind::ALL
                .iter()
                .copied()
                .filter(|kind| config.backend_required(*kind))
                .collect(),
            slow_thresholds,
            probe_timeout: Duration::from_secs(config.connections.probe_timeout_secs),
            health_interval: Duration::from_secs(config.connections.health_check_interval_secs),
            shutdown_grace: Duration::from_secs(config.connections.shutdown_grace_secs),
            use_mock_fallbacks: config.service.use_mock_fallbacks,
            test_mode: config.test_mode(),
        }
    }

    pub fn register_relational(&self, store: Arc<dyn RelationalStore>) {
        *self.relational.write() = Some(store);
    }

    pub fn register_kv(&self, store: Arc<dyn KvStore>) {
        *self.kv.write() = Some(store);
    }

    pub fn register_broker(&self, broker: Arc<dyn MessageBroker>) {
        *self.broker.write() = Some(broker);
    }

    pub fn register_document(&self, store: Arc<dyn DocumentStore>) {
        *self.document.write() = Some(store);
    }

    /// Wire in-memory stores for every backend. The key-value slot shares
    /// state with the fallback store.
    pub fn install_test_doubles(&self) {
        self.register_relational(Arc::new(InMemoryRelational::new()));
        self.register_kv(self.fallback_kv.clone());
        self.register_broker(Arc::new(InMemoryBroker::new()));
        self.register_document(Arc::new(InMemoryDocumentStore::new()));
        info!("in-memory test doubles installed for all backends");
    }

    pub fn is_registered(&self, kind: BackendKind) -> bool {
        match kind {
            BackendKind::Relational => self.relational.read().is_some(),
            BackendKind::KeyValue => self.kv.read().is_some(),
            BackendKind::Broker => self.broker.read().is_some(),
            BackendKind::Document => self.document.read().is_some(),
        }
    }

    pub fn required_backends(&self) -> &[BackendKind] {
        &self.required
    }

    pub fn health_interval(&self) -> Duration {
        self.health_interval
    }

    /// Probe every registered backend concurrently; abort when a required
    /// backend is missing or unreachable (unless running in test mode).
    /// Required backends get a few probe retries so a transient blip does
    /// not fail startup; optional ones fail fast and recover through the
    /// background loop.
    pub async fn initialize(&self) -> Result<(), ServiceError> {
        info!(
            required = ?self.required.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
            "initializing backend connections"
        );

        let (relational, kv, broker, document) = tokio::join!(
            self.startup_probe(BackendKind::Relational),
            self.startup_probe(BackendKind::KeyValue),
            self.startup_probe(BackendKind::Broker),
            self.startup_probe(BackendKind::Document),
        );

        let outcomes = [
            (BackendKind::Relational, relational),
            (BackendKind::KeyValue, kv),
            (BackendKind::Broker, broker),
            (BackendKind::Document, document),
        ];

        let mut failed = Vec::new();
        for (kind, outcome) in outcomes {
            match outcome {
                None => {
                    if self.required.contains(&kind) {
                        failed.push(kind.as_str());
                    } else {
                        debug!(backend = kind.as_str(), "backend not registered, skipping");
                    }
                }
                Some(Ok(latency)) => {
                    let mut order = self.init_order.lock();
                    if !order.contains(&kind) {
                        order.push(kind);
                    }
                    drop(order);
                    self.mark_success(kind, latency);
                    info!(
                        backend = kind.as_str(),
                        latency_ms = latency.as_millis() as u64,
                        "backend connected"
                    );
                }
                Some(Err(err)) => {
                    self.mark_failure(kind, &err);
                    error!(backend = kind.as_str(), error = %err, "backend connection failed");
                    if self.required.contains(&kind) {
                        failed.push(kind.as_str());
                    }
                }
            }
        }

        if !failed.is_empty() {
            let joined = failed.join(", ");
            if self.test_mode {
                warn!(backends = %joined, "required backends unavailable, continuing in test mode");
            } else {
                return Err(ServiceError::system(format!(
                    "startup failed, could not connect to: {}",
                    joined
                ))
                .with_code("STARTUP_FAILED"));
            }
        }

        Ok(())
    }

    async fn startup_probe(&self, kind: BackendKind) -> Option<Result<Duration, ServiceError>> {
        let attempts = if self.required.contains(&kind) {
            STARTUP_PROBE_ATTEMPTS
        } else {
            1
        };
        let mut attempt = 1;
        loop {
            let outcome = self.probe_kind(kind).await?;
            match outcome {
                Ok(latency) => return Some(Ok(latency)),
                Err(err) if attempt < attempts => {
                    warn!(
                        backend = kind.as_str(),
                        attempt,
                        error = %err,
                        "startup probe failed, retrying"
                    );
                    tokio::time::sleep(STARTUP_RETRY_DELAY).await;
                    attempt += 1;
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }

    async fn probe_kind(&self, kind: BackendKind) -> Option<Result<Duration, ServiceError>> {
        let started = Instant::now();
        let outcome = match kind {
            BackendKind::Relational => {
                let client = self.relational.read().clone()?;
                self.with_probe_timeout(kind, async move { client.ping().await })
                    .await
            }
            BackendKind::KeyValue => {
                let client = self.kv.read().clone()?;
                self.with_probe_timeout(kind, async move { client.ping().await })
                    .await
            }
            BackendKind::Broker => {
                let client = self.broker.read().clone()?;
                self.with_probe_timeout(kind, async move { client.ping().await })
                    .await
            }
            BackendKind::Document => {
                let client = self.document.read().clone()?;
                self.with_probe_timeout(kind, async move { client.ping().await })
                    .await
            }
        };
        Some(outcome.map(|_| started.elapsed()))
    }

    async fn with_probe_timeout<F>(&self, kind: BackendKind, ping: F) -> Result<(), ServiceError>
    where
        F: Future<Output = BackendResult<()>>,
    {
        match tokio::time::timeout(self.probe_timeout, ping).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::timeout(
                format!("{} probe", kind.as_str()),
                self.probe_timeout,
            )),
        }
    }

    fn mark_success(&self, kind: BackendKind, latency: Duration) {
        let breaker = self.breakers.get(kind);
        breaker.record_success();

        let slow = latency > *self.slow_thresholds.get(kind);
        let status = if slow {
            BackendStatus::Degraded
        } else {
            BackendStatus::Healthy
        };
        if slow {
            warn!(
                backend = kind.as_str(),
                latency_ms = latency.as_millis() as u64,
                "slow backend response"
            );
        }

        let mut health = self.health.write();
        if let Some(entry) = health.get_mut(&kind) {
            entry.status = status;
            entry.last_check = unix_secs_f64();
            entry.error_count = entry.error_count.saturating_sub(1);
            entry.latency_ms = Some(latency.as_secs_f64() * 1000.0);
            entry.last_error = slow.then(|| {
                format!("slow response: {:.3}s", latency.as_secs_f64())
            });
            entry.circuit_breaker_open = breaker.state() == CircuitState::Open;
        }
        drop(health);
        self.status_gauges.get(kind).set(status.gauge_value());
    }

    fn mark_failure(&self, kind: BackendKind, err: &ServiceError) {
        let breaker = self.breakers.get(kind);
        breaker.record_failure();
        self.error_counters.get(kind).increment();

        let mut health = self.health.write();
        if let Some(entry) = health.get_mut(&kind) {
            entry.status = BackendStatus::Unhealthy;
            entry.last_check = unix_secs_f64();
            entry.error_count += 1;
            entry.last_error = Some(err.to_string());
            entry.circuit_breaker_open = breaker.state() == CircuitState::Open;
        }
        drop(health);
        self.status_gauges
            .get(kind)
            .set(BackendStatus::Unhealthy.gauge_value());
    }

    /// Run one probe round over the registered backends.
    pub async fn probe_now(&self) {
        self.health_checks.increment();
        let (relational, kv, broker, document) = tokio::join!(
            self.probe_kind(BackendKind::Relational),
            self.probe_kind(BackendKind::KeyValue),
            self.probe_kind(BackendKind::Broker),
            self.probe_kind(BackendKind::Document),
        );
        let outcomes = [
            (BackendKind::Relational, relational),
            (BackendKind::KeyValue, kv),
            (BackendKind::Broker, broker),
            (BackendKind::Document, document),
        ];
        for (kind, outcome) in outcomes {
            match outcome {
                None => {}
                Some(Ok(latency)) => self.mark_success(kind, latency),
                Some(Err(err)) => {
                    warn!(backend = kind.as_str(), error = %err, "backend probe failed");
                    self.mark_failure(kind, &err);
                }
            }
        }
    }

    /// Background probe loop. Runs until the stop signal flips.
    pub fn spawn_health_loop(
        self: &Arc<Self>,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        info!(
            interval_secs = manager.health_interval.as_secs(),
            "connection health loop started"
        );
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(manager.health_interval) => {
                        manager.probe_now().await;
                    }
                    _ = stop.changed() => {
                        debug!("connection health loop stopping");
                        break;
                    }
                }
            }
        })
    }

    pub fn relational(&self) -> Result<Arc<dyn RelationalStore>, ServiceError> {
        let breaker = self.breakers.get(BackendKind::Relational);
        if !breaker.is_call_permitted() {
            return Err(ServiceError::circuit_open(
                BackendKind::Relational.as_str(),
                Some(breaker.retry_after()),
            ));
        }
        self.relational
            .read()
            .clone()
            .ok_or_else(|| not_initialized(BackendKind::Relational))
    }

    /// Key-value client; serves the in-memory fallback when the breaker
    /// is open or nothing was registered and mock fallbacks are enabled.
    pub fn kv(&self) -> Result<Arc<dyn KvStore>, ServiceError> {
        let breaker = self.breakers.get(BackendKind::KeyValue);
        if !breaker.is_call_permitted() {
            if self.use_mock_fallbacks {
                warn!("key-value circuit open, serving in-memory fallback (data will not persist)");
                return Ok(self.fallback_kv.clone());
            }
            return Err(ServiceError::circuit_open(
                BackendKind::KeyValue.as_str(),
                Some(breaker.retry_after()),
            ));
        }
        match self.kv.read().clone() {
            Some(client) => Ok(client),
            None if self.use_mock_fallbacks => {
                warn!("key-value store not registered, serving in-memory fallback");
                Ok(self.fallback_kv.clone())
            }
            None => Err(not_initialized(BackendKind::KeyValue)),
        }
    }

    pub fn broker(&self) -> Result<Arc<dyn MessageBroker>, ServiceError> {
        let breaker = self.breakers.get(BackendKind::Broker);
        if !breaker.is_call_permitted() {
            return Err(ServiceError::circuit_open(
                BackendKind::Broker.as_str(),
                Some(breaker.retry_after()),
            ));
        }
        self.broker
            .read()
            .clone()
            .ok_or_else(|| not_initialized(BackendKind::Broker))
    }

    pub fn document(&self) -> Result<Arc<dyn DocumentStore>, ServiceError> {
        let breaker = self.breakers.get(BackendKind::Document);
        if !breaker.is_call_permitted() {
            return Err(ServiceError::circuit_open(
                BackendKind::Document.as_str(),
                Some(breaker.retry_after()),
            ));
        }
        self.document
            .read()
            .clone()
            .ok_or_else(|| not_initialized(BackendKind::Document))
    }

    /// The shared fallback store, for wiring components that tolerate
    /// non-persistence.
    pub fn fallback_kv(&self) -> Arc<InMemoryKv> {
        self.fallback_kv.clone()
    }

    pub fn backend_health(&self, kind: BackendKind) -> Option<BackendHealth> {
        self.health.read().get(&kind).cloned()
    }

    /// Snapshot keyed by backend name.
    pub fn all_health(&self) -> HashMap<String, BackendHealth> {
        self.health
            .read()
            .iter()
            .map(|(kind, health)| (kind.as_str().to_string(), health.clone()))
            .collect()
    }

    pub fn statuses(&self) -> HashMap<BackendKind, BackendStatus> {
        self.health
            .read()
            .iter()
            .map(|(kind, health)| (*kind, health.status))
            .collect()
    }

    /// True when every required backend is usable.
    pub fn ready(&self) -> bool {
        let health = self.health.read();
        self.required.iter().all(|kind| {
            health
                .get(kind)
                .map(|entry| entry.status.is_available())
                .unwrap_or(false)
        })
    }

    /// Close clients in reverse initialization order. Later calls are
    /// no-ops.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("connection manager already shut down");
            return;
        }

        let order: Vec<BackendKind> = {
            let mut order = self.init_order.lock();
            order.reverse();
            order.clone()
        };
        info!(
            order = ?order.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
            "closing backend connections"
        );

        let deadline = Instant::now() + self.shutdown_grace;
        for kind in order {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let closed = match kind {
                BackendKind::Relational => {
                    let client = self.relational.read().clone();
                    match client {
                        Some(client) => {
                            tokio::time::timeout(remaining, client.close()).await.is_ok()
                        }
                        None => true,
                    }
                }
                BackendKind::KeyValue => {
                    let client = self.kv.read().clone();
                    match client {
                        Some(client) => {
                            tokio::time::timeout(remaining, client.close()).await.is_ok()
                        }
                        None => true,
                    }
                }
                BackendKind::Broker => {
                    let client = self.broker.read().clone();
                    match client {
                        Some(client) => {
                            tokio::time::timeout(remaining, client.close()).await.is_ok()
                        }
                        None => true,
                    }
                }
                BackendKind::Document => {
                    let client = self.document.read().clone();
                    match client {
                        Some(client) => {
                            tokio::time::timeout(remaining, client.close()).await.is_ok()
                        }
                        None => true,
                    }
                }
            };
            if closed {
                info!(backend = kind.as_str(), "backend closed");
            } else {
                warn!(backend = kind.as_str(), "backend close timed out");
            }
        }
    }
}

fn not_initialized(kind: BackendKind) -> ServiceError {
    ServiceError::system(format!("{} backend not initialized", kind.as_str()))
        .with_code("BACKEND_NOT_INITIALIZED")
}
