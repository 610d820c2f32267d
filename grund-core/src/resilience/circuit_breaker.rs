//! Circuit breaker pattern for preventing cascade failures
//!
//! Monitors operation success/failure rates and automatically trips to prevent
//! overwhelming failing services. Implements the three-state circuit breaker:
//! Closed (normal) → Open (tripped) → HalfOpen (testing recovery). Calls are
//! classified through the error taxonomy, so a breaker can be told to ignore
//! validation noise or to only count, say, database failures.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::{ErrorCategory, ErrorContext, ServiceError};
use crate::metrics::{Counter, Gauge, MetricsRegistry};
use crate::utils::time::unix_secs_f64;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed = 0,
    /// Circuit tripped, requests fail fast
    Open = 1,
    /// Testing if service recovered
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Closed,
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Value reported by the `circuit_breaker_state` gauge.
    pub fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub name: String,
    /// Number of failures before opening circuit
    pub failure_threshold: u64,
    /// Time window for counting failures; a gap longer than this restarts
    /// the count
    pub failure_window: Duration,
    /// How long to wait in Open state before trying HalfOpen
    pub recovery_timeout: Duration,
    /// Number of successful requests in HalfOpen to close circuit
    pub success_threshold: u64,
    /// Deadline applied to every call routed through [`CircuitBreaker::call`]
    pub call_timeout: Duration,
    /// Error categories that count as neither success nor failure
    pub ignore: Vec<ErrorCategory>,
    /// Error categories that count as failures; `None` counts everything
    pub record: Option<Vec<ErrorCategory>>,
}

impl CircuitBreakerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
            call_timeout: Duration::from_secs(30),
            ignore: Vec::new(),
            record: None,
        }
    }

    /// Tuning for relational store access
    pub fn database() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 2,
            call_timeout: Duration::from_secs(10),
            ..Self::new("database")
        }
    }

    /// Tuning for the key-value cache
    pub fn cache() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(20),
            success_threshold: 2,
            call_timeout: Duration::from_secs(5),
            ..Self::new("cache")
        }
    }

    /// Tuning for third-party HTTP APIs
    pub fn external_api() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
            call_timeout: Duration::from_secs(30),
            ..Self::new("external_api")
        }
    }

    /// Aggressive configuration (trips fast, recovers fast)
    pub fn aggressive(name: impl Into<String>) -> Self {
        Self {
            failure_threshold: 3,
            failure_window: Duration::from_secs(10),
            recovery_timeout: Duration::from_secs(5),
            success_threshold: 2,
            call_timeout: Duration::from_secs(5),
            ..Self::new(name)
        }
    }

    /// Conservative configuration (for production)
    pub fn conservative(name: impl Into<String>) -> Self {
        Self {
            failure_threshold: 10,
            failure_window: Duration::from_secs(120),
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 5,
            call_timeout: Duration::from_secs(60),
            ..Self::new(name)
        }
    }

    pub fn with_ignore(mut self, categories: &[ErrorCategory]) -> Self {
        self.ignore = categories.to_vec();
        self
    }

    pub fn with_record(mut self, categories: &[ErrorCategory]) -> Self {
        self.record = Some(categories.to_vec());
        self
    }

    fn counts_as_failure(&self, category: ErrorCategory) -> bool {
        if self.ignore.contains(&category) {
            return false;
        }
        match &self.record {
            Some(recorded) => recorded.contains(&category),
            None => true,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::new("circuit_breaker")
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u64,
    pub success_count: u64,
    pub total_requests: u64,
    /// Unix seconds
    pub last_failure_at: Option<f64>,
    pub state_changed_at: f64,
    pub next_attempt_at: Option<f64>,
}

/// Circuit breaker implementation
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failure_count: AtomicU64,
    success_count: AtomicU64,
    total_requests: AtomicU64,
    last_failure_time: Mutex<Option<Instant>>,
    last_state_change: Mutex<Instant>,
    requests: Counter,
    failures: Counter,
    state_gauge: Gauge,
    opened_errors: Counter,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, metrics: &MetricsRegistry) -> Self {
        debug!(circuit = %config.name, ?config, "creating circuit breaker");
        let circuit_tag = [("circuit", config.name.as_str())];
        let breaker = Self {
            requests: metrics.counter("circuit_breaker_requests_total", &circuit_tag),
            failures: metrics.counter("circuit_breaker_failures_total", &circuit_tag),
            state_gauge: metrics.gauge("circuit_breaker_state", &circuit_tag),
            opened_errors: metrics.counter(
                "trade_errors_total",
                &[
                    ("type", "circuit_breaker_opened"),
                    ("circuit", config.name.as_str()),
                ],
            ),
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            last_failure_time: Mutex::new(None),
            last_state_change: Mutex::new(Instant::now()),
        };
        breaker.state_gauge.set(CircuitState::Closed.gauge_value());
        breaker
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Run `operation` behind the breaker. The operation is invoked at most
    /// once, and only when the breaker permits the call; it races the
    /// configured call timeout, and a timeout counts as a failure.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        self.requests.increment();

        if !self.is_call_permitted() {
            warn!(circuit = %self.config.name, "call rejected while circuit is open");
            return Err(self.open_error());
        }

        match tokio::time::timeout(self.config.call_timeout, operation()).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                if self.config.counts_as_failure(err.category) {
                    self.record_failure();
                } else {
                    debug!(
                        circuit = %self.config.name,
                        category = %err.category,
                        "error not counted by breaker"
                    );
                }
                Err(err)
            }
            Err(_) => {
                self.record_failure();
                Err(ServiceError::timeout(
                    format!("call through circuit '{}'", self.config.name),
                    self.config.call_timeout,
                ))
            }
        }
    }

    /// Check if operation is allowed to proceed. Flips OPEN to HALF_OPEN
    /// once the recovery timeout has elapsed.
    pub fn is_call_permitted(&self) -> bool {
        let state: CircuitState = self.state.load(Ordering::Acquire).into();

        match state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let last_change = *self.last_state_change.lock();
                if last_change.elapsed() >= self.config.recovery_timeout {
                    self.transition_to_half_open();
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    /// Record successful operation (manual entry point for callers that
    /// cannot route through [`CircuitBreaker::call`]).
    pub fn record_success(&self) {
        self.total_requests.fetch_add(1, Ordering::AcqRel);
        let state: CircuitState = self.state.load(Ordering::Acquire).into();

        match state {
            CircuitState::Closed => {
                // Reset failure count on success
                self.failure_count.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                let successes = self.success_count.fetch_add(1, Ordering::AcqRel) + 1;
                info!(
                    circuit = %self.config.name,
                    successes,
                    success_threshold = self.config.success_threshold,
                    "success in half-open state"
                );
                if successes >= self.config.success_threshold {
                    self.transition_to_closed();
                }
            }
            CircuitState::Open => {
                // Ignore successes in Open state
            }
        }
    }

    /// Record failed operation (manual entry point).
    pub fn record_failure(&self) {
        self.total_requests.fetch_add(1, Ordering::AcqRel);
        self.failures.increment();
        let state: CircuitState = self.state.load(Ordering::Acquire).into();

        let mut last_failure = self.last_failure_time.lock();
        let now = Instant::now();
        let failures = match state {
            CircuitState::Closed => {
                // A long quiet gap restarts the failure count
                let stale = last_failure
                    .map(|prev| now.duration_since(prev) > self.config.failure_window)
                    .unwrap_or(false);
                if stale {
                    self.failure_count.store(1, Ordering::Release);
                    1
                } else {
                    self.failure_count.fetch_add(1, Ordering::AcqRel) + 1
                }
            }
            _ => self.failure_count.fetch_add(1, Ordering::AcqRel) + 1,
        };
        *last_failure = Some(now);
        drop(last_failure);

        warn!(
            circuit = %self.config.name,
            failures,
            state = %state,
            "request failed"
        );

        match state {
            CircuitState::Closed => {
                if failures >= self.config.failure_threshold {
                    self.transition_to_open();
                }
            }
            CircuitState::HalfOpen => {
                // Any failure in HalfOpen immediately opens circuit
                self.transition_to_open();
            }
            CircuitState::Open => {}
        }
    }

    /// Get current state
    pub fn state(&self) -> CircuitState {
        self.state.load(Ordering::Acquire).into()
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Acquire)
    }

    pub fn success_count(&self) -> u64 {
        self.success_count.load(Ordering::Acquire)
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.state();
        let now_unix = unix_secs_f64();
        let last_failure_at = self
            .last_failure_time
            .lock()
            .map(|i| now_unix - i.elapsed().as_secs_f64());
        let state_changed = *self.last_state_change.lock();
        let state_changed_at = now_unix - state_changed.elapsed().as_secs_f64();
        let next_attempt_at = if state == CircuitState::Open {
            Some(state_changed_at + self.config.recovery_timeout.as_secs_f64())
        } else {
            None
        };

        CircuitBreakerStats {
            state,
            failure_count: self.failure_count.load(Ordering::Acquire),
            success_count: self.success_count.load(Ordering::Acquire),
            total_requests: self.total_requests.load(Ordering::Acquire),
            last_failure_at,
            state_changed_at,
            next_attempt_at,
        }
    }

    /// Time until the breaker next permits a probe call; zero when not open.
    pub fn retry_after(&self) -> Duration {
        if self.state() != CircuitState::Open {
            return Duration::ZERO;
        }
        let elapsed = self.last_state_change.lock().elapsed();
        self.config.recovery_timeout.saturating_sub(elapsed)
    }

    fn open_error(&self) -> ServiceError {
        let stats = self.stats();
        let context = ErrorContext::new().with_extra(
            "circuit_stats",
            serde_json::to_value(&stats).unwrap_or(serde_json::Value::Null),
        );
        ServiceError::circuit_open(&self.config.name, Some(self.retry_after()))
            .with_context(context)
    }

    /// Reset circuit breaker to Closed state
    pub fn reset(&self) {
        info!(circuit = %self.config.name, "circuit breaker manually reset to CLOSED");
        self.transition_to_closed();
    }

    /// Force circuit breaker to Open state
    pub fn force_open(&self) {
        warn!(circuit = %self.config.name, "circuit breaker manually forced to OPEN");
        self.transition_to_open();
    }

    fn transition_to_closed(&self) {
        info!(circuit = %self.config.name, "circuit breaker transitioning to CLOSED");
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
        *self.last_state_change.lock() = Instant::now();
        self.state_gauge.set(CircuitState::Closed.gauge_value());
    }

    fn transition_to_open(&self) {
        warn!(
            circuit = %self.config.name,
            failure_threshold = self.config.failure_threshold,
            "circuit breaker TRIPPED - transitioning to OPEN"
        );
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
        *self.last_state_change.lock() = Instant::now();
        self.state_gauge.set(CircuitState::Open.gauge_value());
        self.opened_errors.increment();
    }

    fn transition_to_half_open(&self) {
        debug!(
            circuit = %self.config.name,
            "circuit breaker transitioning to HALF-OPEN (testing recovery)"
        );
        self.state.store(CircuitState::HalfOpen as u8, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.success_count.store(0, Ordering::Release);
        *self.last_state_change.lock() = Instant::now();
        self.state_gauge.set(CircuitState::HalfOpen.gauge_value());
    }
}

/// Named breaker registry. Construct one per process and share by `Arc`.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    metrics: Arc<MetricsRegistry>,
}

impl CircuitBreakerRegistry {
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        metrics.describe(
            "circuit_breaker_state",
            "Circuit breaker state (0=closed, 1=half_open, 2=open)",
        );
        metrics.describe(
            "circuit_breaker_requests_total",
            "Total requests through circuit breaker",
        );
        metrics.describe(
            "circuit_breaker_failures_total",
            "Total failures in circuit breaker",
        );
        Self {
            breakers: DashMap::new(),
            metrics,
        }
    }

    /// Get or create a breaker with default configuration.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(CircuitBreakerConfig::new(name))
    }

    /// Get or create a breaker; an existing breaker keeps its original
    /// configuration.
    pub fn get_or_create_with(&self, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let name = config.name.clone();
        self.breakers
            .entry(name)
            .or_insert_with(|| {
                info!(circuit = %config.name, "created circuit breaker");
                Arc::new(CircuitBreaker::new(config, &self.metrics))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| entry.clone())
    }

    /// Manually reset one breaker to CLOSED; false when unknown.
    pub fn reset(&self, name: &str) -> bool {
        match self.breakers.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        let removed = self.breakers.remove(name).is_some();
        if removed {
            info!(circuit = name, "removed circuit breaker");
        }
        removed
    }

    /// Statistics for every registered breaker, sorted by name.
    pub fn all_stats(&self) -> BTreeMap<String, CircuitBreakerStats> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn breaker(config: CircuitBreakerConfig) -> (Arc<MetricsRegistry>, CircuitBreaker) {
        let metrics = Arc::new(MetricsRegistry::new());
        let cb = CircuitBreaker::new(config, &metrics);
        (metrics, cb)
    }

    #[test]
    fn test_starts_closed() {
        let (_m, cb) = breaker(CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.is_call_permitted());
    }

    #[test]
    fn test_opens_on_consecutive_failures() {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        };
        let (_m, cb) = breaker(config);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.is_call_permitted());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        };
        let (_m, cb) = breaker(config);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.failure_count(), 2);

        cb.record_success();
        assert_eq!(cb.failure_count(), 0);

        // failures after a success start over
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_recovery() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_millis(10),
            success_threshold: 2,
            ..Default::default()
        };
        let (_m, cb) = breaker(config);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(15));

        assert!(cb.is_call_permitted());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_millis(10),
            ..Default::default()
        };
        let (_m, cb) = breaker(config);

        cb.record_failure();
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.is_call_permitted());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_call_runs_operation_once_when_permitted() {
        let (_m, cb) = breaker(CircuitBreakerConfig::default());
        let invocations = AtomicUsize::new(0);

        let result = cb
            .call(|| async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ServiceError>(42)
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_rejects_without_invoking() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let (metrics, cb) = breaker(config);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        let invocations = AtomicUsize::new(0);
        let err = cb
            .call(|| async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ServiceError>(())
            })
            .await
            .unwrap_err();

        assert_eq!(invocations.load(Ordering::SeqCst), 0);
        assert_eq!(err.code, "CIRCUIT_OPEN");
        assert!(err.retry_after.is_some());
        assert_eq!(
            metrics.latest("circuit_breaker_state", &[("circuit", "circuit_breaker")]),
            Some(2.0)
        );
    }

    #[tokio::test]
    async fn test_call_timeout_counts_as_failure() {
        let config = CircuitBreakerConfig {
            failure_threshold: 5,
            call_timeout: Duration::from_millis(10),
            ..Default::default()
        };
        let (_m, cb) = breaker(config);

        let err = cb
            .call(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, ServiceError>(())
            })
            .await
            .unwrap_err();

        assert_eq!(err.code, "TIMEOUT");
        assert_eq!(cb.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_ignored_categories_do_not_count() {
        let config = CircuitBreakerConfig::new("ignoring")
            .with_ignore(&[ErrorCategory::Validation]);
        let (_m, cb) = breaker(config);

        let err = cb
            .call(|| async { Err::<(), _>(ServiceError::validation("bad input")) })
            .await
            .unwrap_err();

        assert_eq!(err.category, ErrorCategory::Validation);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_record_set_restricts_counted_categories() {
        let config = CircuitBreakerConfig::new("selective")
            .with_record(&[ErrorCategory::Database]);
        let (_m, cb) = breaker(config);

        cb.call(|| async { Err::<(), _>(ServiceError::network("blip")) })
            .await
            .unwrap_err();
        assert_eq!(cb.failure_count(), 0);

        cb.call(|| async { Err::<(), _>(ServiceError::database("down")) })
            .await
            .unwrap_err();
        assert_eq!(cb.failure_count(), 1);
    }

    #[test]
    fn test_stats_snapshot() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        let (_m, cb) = breaker(config);
        cb.record_failure();

        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.total_requests, 1);
        assert!(stats.last_failure_at.is_some());
        let next = stats.next_attempt_at.unwrap();
        assert!(next > stats.state_changed_at + 29.0);
    }

    #[test]
    fn test_failure_window_restarts_count() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            failure_window: Duration::from_millis(20),
            ..Default::default()
        };
        let (_m, cb) = breaker(config);

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        // outside the window, so the count restarts at 1
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_registry_get_or_create_and_reset() {
        let metrics = Arc::new(MetricsRegistry::new());
        let registry = CircuitBreakerRegistry::new(metrics);

        let a = registry.get_or_create("database");
        let b = registry.get_or_create("database");
        assert!(Arc::ptr_eq(&a, &b));

        a.force_open();
        assert_eq!(b.state(), CircuitState::Open);

        assert!(registry.reset("database"));
        assert_eq!(a.state(), CircuitState::Closed);
        assert!(!registry.reset("no_such_breaker"));

        let stats = registry.all_stats();
        assert!(stats.contains_key("database"));

        assert!(registry.remove("database"));
        assert!(registry.get("database").is_none());
    }

    #[test]
    fn test_preset_configs() {
        let db = CircuitBreakerConfig::database();
        assert_eq!(db.failure_threshold, 3);
        assert_eq!(db.recovery_timeout, Duration::from_secs(30));
        assert_eq!(db.call_timeout, Duration::from_secs(10));

        let cache = CircuitBreakerConfig::cache();
        assert_eq!(cache.failure_threshold, 5);
        assert_eq!(cache.call_timeout, Duration::from_secs(5));

        let api = CircuitBreakerConfig::external_api();
        assert_eq!(api.recovery_timeout, Duration::from_secs(60));
    }
}
