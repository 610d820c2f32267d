//! Rate limiting over the key-value store.
//!
//! Three algorithms share one decision record: sliding window (ordered
//! set per key), token bucket (atomic take), and fixed window (counter
//! per window bucket). Every limiter fails open: when the store errors
//! or was never wired up, requests are allowed and the outage is logged
//! and counted instead of turning into a client-facing failure.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::{Config, RateLimitSettings};
use crate::connections::backends::{BackendResult, KvStore};
use crate::errors::ServiceError;
use crate::metrics::{Counter, Gauge, MetricsRegistry};
use crate::utils::time::unix_secs_f64;

/// Rate limiting algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    SlidingWindow,
    TokenBucket,
    FixedWindow,
}

impl RateLimitAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SlidingWindow => "sliding_window",
            Self::TokenBucket => "token_bucket",
            Self::FixedWindow => "fixed_window",
        }
    }
}

impl FromStr for RateLimitAlgorithm {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sliding_window" => Ok(Self::SlidingWindow),
            "token_bucket" => Ok(Self::TokenBucket),
            "fixed_window" => Ok(Self::FixedWindow),
            other => Err(ServiceError::validation(format!(
                "unknown rate limit algorithm '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for RateLimitAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for one limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub name: String,
    pub max_requests: u64,
    pub window: Duration,
    pub algorithm: RateLimitAlgorithm,
    /// Token bucket capacity; defaults to `max_requests`.
    pub burst_size: Option<u64>,
    pub key_prefix: String,
}

impl RateLimitConfig {
    pub fn new(name: impl Into<String>, max_requests: u64, window: Duration) -> Self {
        Self {
            name: name.into(),
            max_requests,
            window,
            algorithm: RateLimitAlgorithm::SlidingWindow,
            burst_size: None,
            key_prefix: "rate_limit".to_string(),
        }
    }

    pub fn with_algorithm(mut self, algorithm: RateLimitAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst_size = Some(burst);
        self
    }

    /// General API traffic: 100 requests/minute, sliding window.
    pub fn api_requests() -> Self {
        Self::new("api_requests", 100, Duration::from_secs(60))
    }

    /// Order placement: 10/minute token bucket with a burst of 15.
    pub fn order_placement() -> Self {
        Self::new("order_placement", 10, Duration::from_secs(60))
            .with_algorithm(RateLimitAlgorithm::TokenBucket)
            .with_burst(15)
    }

    /// Market data fetches: 50/minute, sliding window.
    pub fn data_fetching() -> Self {
        Self::new("data_fetching", 50, Duration::from_secs(60))
    }

    /// Login attempts: 5/minute, fixed window.
    pub fn authentication() -> Self {
        Self::new("authentication", 5, Duration::from_secs(60))
            .with_algorithm(RateLimitAlgorithm::FixedWindow)
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    /// Unix seconds when the limit resets.
    pub reset_at: f64,
    /// Seconds to wait before retrying, present on denials.
    pub retry_after: Option<u64>,
    pub total_in_window: u64,
    /// Unix seconds; absent for token bucket and fail-open decisions.
    pub window_start: Option<f64>,
}

/// One named limiter bound to a key-value store.
pub struct RateLimiter {
    config: RateLimitConfig,
    kv: Option<Arc<dyn KvStore>>,
    member_seq: AtomicU64,
    checks: Counter,
    denied: Counter,
    errors: Counter,
    remaining_gauge: Gauge,
}

impl RateLimiter {
    pub fn new(
        config: RateLimitConfig,
        kv: Option<Arc<dyn KvStore>>,
        metrics: &MetricsRegistry,
    ) -> Self {
        let limiter_tag = [("limiter", config.name.as_str())];
        Self {
            checks: metrics.counter("rate_limit_checks_total", &limiter_tag),
            denied: metrics.counter("rate_limit_denied_total", &limiter_tag),
            errors: metrics.counter("rate_limit_errors_total", &limiter_tag),
            remaining_gauge: metrics.gauge("rate_limit_remaining", &limiter_tag),
            member_seq: AtomicU64::new(0),
            config,
            kv,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check a principal against this limiter at the current time.
    pub async fn check(&self, key: &str) -> RateLimitDecision {
        self.check_at(key, unix_secs_f64()).await
    }

    /// Check at an explicit unix-second timestamp.
    pub async fn check_at(&self, key: &str, now: f64) -> RateLimitDecision {
        self.checks.increment();

        let Some(kv) = self.kv.clone() else {
            return self.fail_open("key-value store not configured");
        };

        let result = match self.config.algorithm {
            RateLimitAlgorithm::SlidingWindow => self.check_sliding(&*kv, key, now).await,
            RateLimitAlgorithm::TokenBucket => self.check_bucket(&*kv, key, now).await,
            RateLimitAlgorithm::FixedWindow => self.check_fixed(&*kv, key, now).await,
        };

        match result {
            Ok(decision) => {
                if decision.allowed {
                    self.remaining_gauge.set(decision.remaining as f64);
                } else {
                    self.denied.increment();
                    self.remaining_gauge.set(0.0);
                }
                decision
            }
            Err(err) => {
                error!(
                    limiter = %self.config.name,
                    error = %err,
                    "key-value store error during rate limit check"
                );
                self.fail_open("key-value store error")
            }
        }
    }

    fn kv_key(&self, key: &str) -> String {
        format!("{}:{}:{}", self.config.key_prefix, self.config.name, key)
    }

    fn fail_open(&self, reason: &str) -> RateLimitDecision {
        warn!(limiter = %self.config.name, reason, "rate limiter failing open");
        self.errors.increment();
        let capacity = match self.config.algorithm {
            RateLimitAlgorithm::TokenBucket => {
                self.config.burst_size.unwrap_or(self.config.max_requests)
            }
            _ => self.config.max_requests,
        };
        RateLimitDecision {
            allowed: true,
            remaining: capacity.saturating_sub(1),
            reset_at: unix_secs_f64() + self.config.window.as_secs_f64(),
            retry_after: None,
            total_in_window: 0,
            window_start: None,
        }
    }

    async fn check_sliding(
        &self,
        kv: &dyn KvStore,
        key: &str,
        now: f64,
    ) -> BackendResult<RateLimitDecision> {
        let kv_key = self.kv_key(key);
        let window_secs = self.config.window.as_secs_f64();
        let window_start = now - window_secs;

        kv.zremrangebyscore(&kv_key, 0.0, window_start).await?;
        let in_window = kv.zcard(&kv_key).await?;
        let member = format!(
            "{:.6}-{}",
            now,
            self.member_seq.fetch_add(1, Ordering::Relaxed)
        );
        kv.zadd(&kv_key, &member, now).await?;
        kv.expire(&kv_key, self.config.window + Duration::from_secs(1))
            .await?;

        if in_window >= self.config.max_requests {
            // roll back the optimistic add
            kv.zrem(&kv_key, &member).await?;

            let oldest = kv.zrange_withscores(&kv_key, 0, 0).await?;
            let retry_after = oldest
                .first()
                .map(|entry| (entry.score + window_secs - now + 1.0).max(0.0) as u64);

            return Ok(RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at: now + window_secs,
                retry_after,
                total_in_window: in_window,
                window_start: Some(window_start),
            });
        }

        Ok(RateLimitDecision {
            allowed: true,
            remaining: self.config.max_requests - in_window - 1,
            reset_at: now + window_secs,
            retry_after: None,
            total_in_window: in_window + 1,
            window_start: Some(window_start),
        })
    }

    async fn check_bucket(
        &self,
        kv: &dyn KvStore,
        key: &str,
        now: f64,
    ) -> BackendResult<RateLimitDecision> {
        let capacity = self.config.burst_size.unwrap_or(self.config.max_requests) as f64;
        let refill_rate = self.config.max_requests as f64 / self.config.window.as_secs_f64();

        let (allowed, tokens) = kv
            .token_bucket_take(&self.kv_key(key), capacity, refill_rate, now)
            .await?;

        if allowed {
            Ok(RateLimitDecision {
                allowed: true,
                remaining: tokens as u64,
                reset_at: now + self.config.window.as_secs_f64(),
                retry_after: None,
                total_in_window: 0,
                window_start: None,
            })
        } else {
            let time_for_token = 1.0 / refill_rate;
            Ok(RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at: now + time_for_token,
                retry_after: Some(time_for_token as u64 + 1),
                total_in_window: 0,
                window_start: None,
            })
        }
    }

    async fn check_fixed(
        &self,
        kv: &dyn KvStore,
        key: &str,
        now: f64,
    ) -> BackendResult<RateLimitDecision> {
        let window_secs = self.config.window.as_secs();
        let now_secs = now as u64;
        let window_start = (now_secs / window_secs) * window_secs;
        let bucket_key = format!("{}:{}", self.kv_key(key), window_start);

        let count = kv.incr_with_expire(&bucket_key, self.config.window).await? as u64;

        if count > self.config.max_requests {
            let next_window = window_start + window_secs;
            return Ok(RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at: next_window as f64,
                retry_after: Some(next_window.saturating_sub(now_secs)),
                total_in_window: count,
                window_start: Some(window_start as f64),
            });
        }

        Ok(RateLimitDecision {
            allowed: true,
            remaining: self.config.max_requests - count,
            reset_at: (window_start + window_secs) as f64,
            retry_after: None,
            total_in_window: count,
            window_start: Some(window_start as f64),
        })
    }
}

/// Named limiters sharing one store.
pub struct RateLimiterManager {
    limiters: DashMap<String, Arc<RateLimiter>>,
    kv: Option<Arc<dyn KvStore>>,
    metrics: Arc<MetricsRegistry>,
}

impl RateLimiterManager {
    pub fn new(kv: Option<Arc<dyn KvStore>>, metrics: Arc<MetricsRegistry>) -> Self {
        metrics.describe("rate_limit_checks_total", "Rate limit checks performed");
        metrics.describe("rate_limit_denied_total", "Requests denied by rate limiters");
        metrics.describe(
            "rate_limit_errors_total",
            "Rate limit checks that failed open on store errors",
        );
        metrics.describe("rate_limit_remaining", "Remaining requests in the current window");
        Self {
            limiters: DashMap::new(),
            kv,
            metrics,
        }
    }

    /// Build from configuration, then fill in the default limiter set
    /// without overriding configured names.
    pub fn from_config(
        config: &Config,
        kv: Option<Arc<dyn KvStore>>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, ServiceError> {
        let manager = Self::new(kv, metrics);
        for (name, settings) in &config.rate_limits {
            manager.add_limiter(limiter_config(name, settings)?);
        }
        manager.install_defaults();
        Ok(manager)
    }

    pub fn add_limiter(&self, config: RateLimitConfig) -> Arc<RateLimiter> {
        let name = config.name.clone();
        let algorithm = config.algorithm;
        let limiter = Arc::new(RateLimiter::new(config, self.kv.clone(), &self.metrics));
        self.limiters.insert(name.clone(), limiter.clone());
        info!(limiter = %name, algorithm = %algorithm, "added rate limiter");
        limiter
    }

    /// Register the standard limiter set, skipping names already present.
    pub fn install_defaults(&self) {
        for config in [
            RateLimitConfig::api_requests(),
            RateLimitConfig::order_placement(),
            RateLimitConfig::data_fetching(),
            RateLimitConfig::authentication(),
        ] {
            if !self.limiters.contains_key(&config.name) {
                self.add_limiter(config);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(name).map(|entry| entry.clone())
    }

    pub fn limiter_names(&self) -> Vec<String> {
        self.limiters.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Check several limiters in order, stopping at the first denial.
    /// Unknown limiter names are logged and skipped.
    pub async fn check_limits(&self, names: &[&str], key: &str) -> (bool, Vec<RateLimitDecision>) {
        self.check_limits_at(names, key, unix_secs_f64()).await
    }

    pub async fn check_limits_at(
        &self,
        names: &[&str],
        key: &str,
        now: f64,
    ) -> (bool, Vec<RateLimitDecision>) {
        let mut decisions = Vec::new();
        for name in names {
            let Some(limiter) = self.get(name) else {
                warn!(limiter = %name, "rate limiter not found, skipping");
                continue;
            };
            let decision = limiter.check_at(key, now).await;
            let allowed = decision.allowed;
            decisions.push(decision);
            if !allowed {
                break;
            }
        }
        let all_allowed = decisions.iter().all(|d| d.allowed);
        (all_allowed, decisions)
    }

    /// Compose a limiter key from the principal and optional context.
    pub fn compose_key(user: &str, endpoint: Option<&str>, organization: Option<&str>) -> String {
        let mut parts = vec![user];
        if let Some(org) = organization {
            parts.push(org);
        }
        if let Some(endpoint) = endpoint {
            parts.push(endpoint);
        }
        parts.join(":")
    }
}

fn limiter_config(name: &str, settings: &RateLimitSettings) -> Result<RateLimitConfig, ServiceError> {
    let algorithm = settings.algorithm.parse()?;
    let mut config = RateLimitConfig::new(
        name,
        settings.max_requests,
        Duration::from_secs(settings.window_secs),
    )
    .with_algorithm(algorithm);
    if let Some(burst) = settings.burst_size {
        config = config.with_burst(burst);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::memory::InMemoryKv;

    fn limiter(config: RateLimitConfig) -> (Arc<MetricsRegistry>, Arc<InMemoryKv>, RateLimiter) {
        let metrics = Arc::new(MetricsRegistry::new());
        let kv = Arc::new(InMemoryKv::new());
        let l = RateLimiter::new(config, Some(kv.clone()), &metrics);
        (metrics, kv, l)
    }

    #[tokio::test]
    async fn test_sliding_window_enforces_limit() {
        let config = RateLimitConfig::new("api", 3, Duration::from_secs(60));
        let (_m, _kv, l) = limiter(config);

        for expected_remaining in [2, 1, 0] {
            let d = l.check_at("user1", 100.0).await;
            assert!(d.allowed);
            assert_eq!(d.remaining, expected_remaining);
        }

        let denied = l.check_at("user1", 100.0).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.total_in_window, 3);
        // oldest entry at t=100, so the slot frees at 100 + 60 + 1
        assert_eq!(denied.retry_after, Some(61));
        assert_eq!(denied.window_start, Some(40.0));
    }

    #[tokio::test]
    async fn test_sliding_window_slides() {
        let config = RateLimitConfig::new("api", 2, Duration::from_secs(60));
        let (_m, _kv, l) = limiter(config);

        assert!(l.check_at("u", 100.0).await.allowed);
        assert!(l.check_at("u", 130.0).await.allowed);
        assert!(!l.check_at("u", 150.0).await.allowed);
        // t=161: the t=100 entry has left the window
        assert!(l.check_at("u", 161.0).await.allowed);
    }

    #[tokio::test]
    async fn test_sliding_window_denial_rolls_back() {
        let config = RateLimitConfig::new("api", 2, Duration::from_secs(60));
        let (_m, kv, l) = limiter(config);

        l.check_at("u", 100.0).await;
        l.check_at("u", 101.0).await;
        l.check_at("u", 102.0).await; // denied
        assert_eq!(kv.zcard("rate_limit:api:u").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_separate_keys_do_not_share_budget() {
        let config = RateLimitConfig::new("api", 1, Duration::from_secs(60));
        let (_m, _kv, l) = limiter(config);
        assert!(l.check_at("alice", 100.0).await.allowed);
        assert!(l.check_at("bob", 100.0).await.allowed);
        assert!(!l.check_at("alice", 100.0).await.allowed);
    }

    #[tokio::test]
    async fn test_token_bucket_burst_and_refill() {
        // 60 requests/minute = 1 token/sec, burst capacity 2
        let config = RateLimitConfig::new("orders", 60, Duration::from_secs(60))
            .with_algorithm(RateLimitAlgorithm::TokenBucket)
            .with_burst(2);
        let (_m, _kv, l) = limiter(config);

        assert!(l.check_at("u", 1000.0).await.allowed);
        assert!(l.check_at("u", 1000.0).await.allowed);
        let denied = l.check_at("u", 1000.0).await;
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(2));

        // one second refills exactly one token
        assert!(l.check_at("u", 1001.0).await.allowed);
        assert!(!l.check_at("u", 1001.0).await.allowed);
    }

    #[tokio::test]
    async fn test_fixed_window_resets_on_boundary() {
        let config = RateLimitConfig::new("auth", 2, Duration::from_secs(60))
            .with_algorithm(RateLimitAlgorithm::FixedWindow);
        let (_m, _kv, l) = limiter(config);

        let first = l.check_at("u", 100.0).await;
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);
        assert_eq!(first.window_start, Some(60.0));
        assert!(l.check_at("u", 110.0).await.allowed);

        let denied = l.check_at("u", 115.0).await;
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(5));
        assert_eq!(denied.reset_at, 120.0);

        // next window
        assert!(l.check_at("u", 120.0).await.allowed);
    }

    #[tokio::test]
    async fn test_fail_open_without_store() {
        let metrics = Arc::new(MetricsRegistry::new());
        let l = RateLimiter::new(
            RateLimitConfig::new("api", 5, Duration::from_secs(60)),
            None,
            &metrics,
        );
        let d = l.check_at("u", 100.0).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 4);
        assert_eq!(
            metrics.latest("rate_limit_errors_total", &[("limiter", "api")]),
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn test_fail_open_on_store_error() {
        let config = RateLimitConfig::new("api", 5, Duration::from_secs(60));
        let (metrics, kv, l) = limiter(config);
        kv.set_failing(true);
        let d = l.check_at("u", 100.0).await;
        assert!(d.allowed);
        assert_eq!(
            metrics.latest("rate_limit_errors_total", &[("limiter", "api")]),
            Some(1.0)
        );
        assert_eq!(
            metrics.latest("rate_limit_denied_total", &[("limiter", "api")]),
            None
        );
    }

    #[tokio::test]
    async fn test_denied_metric_counted() {
        let config = RateLimitConfig::new("api", 1, Duration::from_secs(60));
        let (metrics, _kv, l) = limiter(config);
        l.check_at("u", 100.0).await;
        l.check_at("u", 100.0).await;
        assert_eq!(
            metrics.latest("rate_limit_denied_total", &[("limiter", "api")]),
            Some(1.0)
        );
        assert_eq!(
            metrics.latest("rate_limit_checks_total", &[("limiter", "api")]),
            Some(2.0)
        );
    }

    #[tokio::test]
    async fn test_manager_short_circuits_on_denial() {
        let metrics = Arc::new(MetricsRegistry::new());
        let kv: Arc<InMemoryKv> = Arc::new(InMemoryKv::new());
        let manager = RateLimiterManager::new(Some(kv), metrics);
        manager.add_limiter(RateLimitConfig::new("strict", 1, Duration::from_secs(60)));
        manager.add_limiter(RateLimitConfig::new("loose", 100, Duration::from_secs(60)));

        let (allowed, decisions) = manager
            .check_limits_at(&["strict", "loose"], "u", 100.0)
            .await;
        assert!(allowed);
        assert_eq!(decisions.len(), 2);

        let (allowed, decisions) = manager
            .check_limits_at(&["strict", "loose"], "u", 100.0)
            .await;
        assert!(!allowed);
        // denied by the first limiter, the second was never consulted
        assert_eq!(decisions.len(), 1);
    }

    #[tokio::test]
    async fn test_manager_skips_unknown_limiters() {
        let metrics = Arc::new(MetricsRegistry::new());
        let manager = RateLimiterManager::new(None, metrics);
        let (allowed, decisions) = manager.check_limits_at(&["ghost"], "u", 100.0).await;
        assert!(allowed);
        assert!(decisions.is_empty());
    }

    #[test]
    fn test_compose_key_ordering() {
        assert_eq!(RateLimiterManager::compose_key("u1", None, None), "u1");
        assert_eq!(
            RateLimiterManager::compose_key("u1", Some("orders"), Some("org9")),
            "u1:org9:orders"
        );
        assert_eq!(
            RateLimiterManager::compose_key("u1", Some("orders"), None),
            "u1:orders"
        );
    }

    #[test]
    fn test_default_limiter_set() {
        let metrics = Arc::new(MetricsRegistry::new());
        let manager = RateLimiterManager::new(None, metrics);
        manager.install_defaults();

        let api = manager.get("api_requests").unwrap();
        assert_eq!(api.config().max_requests, 100);
        assert_eq!(api.config().algorithm, RateLimitAlgorithm::SlidingWindow);

        let orders = manager.get("order_placement").unwrap();
        assert_eq!(orders.config().algorithm, RateLimitAlgorithm::TokenBucket);
        assert_eq!(orders.config().burst_size, Some(15));

        let auth = manager.get("authentication").unwrap();
        assert_eq!(auth.config().algorithm, RateLimitAlgorithm::FixedWindow);
        assert_eq!(auth.config().max_requests, 5);

        assert!(manager.get("data_fetching").is_some());
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!(
            "token_bucket".parse::<RateLimitAlgorithm>().unwrap(),
            RateLimitAlgorithm::TokenBucket
        );
        assert!("leaky_bucket".parse::<RateLimitAlgorithm>().is_err());
    }
}
