//! Service bootstrap façade.
//!
//! Wires the shared infrastructure together in dependency order and
//! owns the background tasks: one call to [`ServiceRuntime::start`]
//! brings a service process up, one call to
//! [`ServiceRuntime::shutdown`] drains it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::alerting::AlertEngine;
use crate::config::Config;
use crate::connections::backends::{BackendResult, KvStore, ScoredMember};
use crate::connections::ConnectionManager;
use crate::errors::ServiceError;
use crate::health::{
    ApplicationHealthCheck, HealthRegistry, KvHealthCheck, RelationalHealthCheck,
    SystemResourcesHealthCheck,
};
use crate::metrics::{MetricsRegistry, TradeMetrics};
use crate::resilience::{
    CircuitBreakerRegistry, DegradationManager, RateLimiterManager, RetryPolicyRegistry,
};
use crate::server::{OpsServer, OpsServerConfig};

/// Key-value handle that resolves through the connection manager on
/// every call, so clients registered after construction (and breaker
/// state changes) are picked up without re-wiring the rate limiters.
struct ManagedKv {
    connections: Arc<ConnectionManager>,
}

#[async_trait]
impl KvStore for ManagedKv {
    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        self.connections.kv()?.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> BackendResult<()> {
        self.connections.kv()?.set(key, value).await
    }

    async fn setex(&self, key: &str, ttl: Duration, value: &str) -> BackendResult<()> {
        self.connections.kv()?.setex(key, ttl, value).await
    }

    async fn delete(&self, key: &str) -> BackendResult<bool> {
        self.connections.kv()?.delete(key).await
    }

    async fn exists(&self, key: &str) -> BackendResult<bool> {
        self.connections.kv()?.exists(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> BackendResult<bool> {
        self.connections.kv()?.expire(key, ttl).await
    }

    async fn incr(&self, key: &str) -> BackendResult<i64> {
        self.connections.kv()?.incr(key).await
    }

    async fn ping(&self) -> BackendResult<()> {
        self.connections.kv()?.ping().await
    }

    /// The connection manager owns the underlying client; closing this
    /// handle must not close the shared connection.
    async fn close(&self) -> BackendResult<()> {
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> BackendResult<bool> {
        self.connections.kv()?.zadd(key, member, score).await
    }

    async fn zcard(&self, key: &str) -> BackendResult<u64> {
        self.connections.kv()?.zcard(key).await
    }

    async fn zrem(&self, key: &str, member: &str) -> BackendResult<bool> {
        self.connections.kv()?.zrem(key, member).await
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> BackendResult<u64> {
        self.connections.kv()?.zremrangebyscore(key, min, max).await
    }

    async fn zrange_withscores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> BackendResult<Vec<ScoredMember>> {
        self.connections.kv()?.zrange_withscores(key, start, stop).await
    }

    async fn incr_with_expire(&self, key: &str, ttl: Duration) -> BackendResult<i64> {
        self.connections.kv()?.incr_with_expire(key, ttl).await
    }

    async fn token_bucket_take(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        now: f64,
    ) -> BackendResult<(bool, f64)> {
        self.connections
            .kv()?
            .token_bucket_take(key, capacity, refill_rate, now)
            .await
    }

    async fn memory_pressure(&self) -> BackendResult<Option<f64>> {
        self.connections.kv()?.memory_pressure().await
    }
}

/// One service process worth of shared infrastructure.
pub struct ServiceRuntime {
    config: Config,
    metrics: Arc<MetricsRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    connections: Arc<ConnectionManager>,
    health: Arc<HealthRegistry>,
    rate_limiters: Arc<RateLimiterManager>,
    retries: Arc<RetryPolicyRegistry>,
    alerts: Arc<AlertEngine>,
    trade_metrics: Arc<TradeMetrics>,
    degradation: Arc<DegradationManager>,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl ServiceRuntime {
    /// Construct every component in dependency order. Nothing touches
    /// the network until [`ServiceRuntime::start`].
    pub fn new(config: Config) -> Result<Self, ServiceError> {
        let metrics = Arc::new(MetricsRegistry::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new(metrics.clone()));
        let connections = Arc::new(ConnectionManager::new(&config, &breakers, &metrics));
        let health = Arc::new(HealthRegistry::new());
        let rate_limiters = Arc::new(RateLimiterManager::from_config(
            &config,
            Some(Arc::new(ManagedKv {
                connections: connections.clone(),
            })),
            metrics.clone(),
        )?);
        let retries = Arc::new(RetryPolicyRegistry::new(metrics.clone()));
        let alerts = Arc::new(AlertEngine::from_config(
            &config,
            metrics.clone(),
            health.clone(),
        ));
        let trade_metrics = Arc::new(TradeMetrics::new(&metrics, &config.service.name));
        let degradation = Arc::new(DegradationManager::new(connections.clone(), metrics.clone()));

        let (stop, _) = watch::channel(false);
        Ok(Self {
            config,
            metrics,
            breakers,
            connections,
            health,
            rate_limiters,
            retries,
            alerts,
            trade_metrics,
            degradation,
            stop,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        self.metrics.clone()
    }

    pub fn breakers(&self) -> Arc<CircuitBreakerRegistry> {
        self.breakers.clone()
    }

    pub fn connections(&self) -> Arc<ConnectionManager> {
        self.connections.clone()
    }

    pub fn health(&self) -> Arc<HealthRegistry> {
        self.health.clone()
    }

    pub fn rate_limiters(&self) -> Arc<RateLimiterManager> {
        self.rate_limiters.clone()
    }

    pub fn retries(&self) -> Arc<RetryPolicyRegistry> {
        self.retries.clone()
    }

    pub fn alerts(&self) -> Arc<AlertEngine> {
        self.alerts.clone()
    }

    pub fn trade_metrics(&self) -> Arc<TradeMetrics> {
        self.trade_metrics.clone()
    }

    pub fn degradation(&self) -> Arc<DegradationManager> {
        self.degradation.clone()
    }

    /// Initialize connections, register the built-in health checks, and
    /// spawn the background tasks. Fails when a required backend is
    /// unreachable outside test mode.
    pub async fn start(&self) -> Result<(), ServiceError> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("service runtime already started");
            return Ok(());
        }
        if let Err(err) = self.start_inner().await {
            self.started.store(false, Ordering::SeqCst);
            return Err(err);
        }
        Ok(())
    }

    async fn start_inner(&self) -> Result<(), ServiceError> {
        info!(
            service = %self.config.service.name,
            env = self.config.service.deployment_env.as_str(),
            "starting service runtime"
        );

        self.connections.initialize().await?;
        self.register_builtin_checks();

        let mut tasks = Vec::new();
        tasks.push(self.metrics.spawn_eviction(
            Duration::from_secs(self.config.metrics.eviction_interval_secs),
            Duration::from_secs(self.config.metrics.retention_secs),
            self.stop.subscribe(),
        ));
        tasks.push(self.connections.spawn_health_loop(self.stop.subscribe()));
        tasks.push(self.alerts.spawn_evaluation_loop(self.stop.subscribe()));

        if self.config.server.enabled {
            let server = Arc::new(OpsServer::new(
                OpsServerConfig::from_config(&self.config)?,
                &self.config.service.name,
                self.metrics.clone(),
                self.health.clone(),
                self.connections.clone(),
            ));
            // Bind before spawning so an unusable address fails startup
            // instead of dying silently inside the task.
            let listener = server.bind().await?;
            let stop = self.stop.subscribe();
            tasks.push(tokio::spawn(async move {
                server.run(listener, stop).await;
            }));
        }

        self.tasks.lock().extend(tasks);
        info!("service runtime started");
        Ok(())
    }

    /// Health checks for whatever is configured right now. Backends a
    /// host registers later are covered by the connection manager's own
    /// probe loop.
    fn register_builtin_checks(&self) {
        if let Ok(store) = self.connections.relational() {
            self.health.add_check(Arc::new(RelationalHealthCheck::new(store)));
        }
        if let Ok(store) = self.connections.kv() {
            self.health.add_check(Arc::new(KvHealthCheck::new(store)));
        }
        self.health.add_check(Arc::new(SystemResourcesHealthCheck::new()));
        self.health
            .add_check(Arc::new(ApplicationHealthCheck::new(self.metrics.clone())));
    }

    /// Signal every background task, wait out the grace period, then
    /// close the backends. Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(service = %self.config.service.name, "shutting down service runtime");
        let _ = self.stop.send(true);

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let grace = Duration::from_secs(self.config.connections.shutdown_grace_secs);
        let drain = async {
            for handle in handles {
                if let Err(err) = handle.await {
                    error!(error = %err, "background task failed during shutdown");
                }
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(
                grace_secs = grace.as_secs(),
                "background tasks did not stop within the grace period"
            );
        }

        self.connections.shutdown().await;
        info!("service runtime stopped");
    }

    #[cfg(test)]
    fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }
}
