//! Resilience Primitive Scenarios
//!
//! End-to-end runs of the documented rate limiter and circuit breaker
//! behaviors, driven with explicit timestamps against the in-memory
//! key-value store.
//!
//! These tests verify:
//! 1. Sliding window: limit 3 / 60s admits three, denies the fourth
//!    with a retry hint, admits again once the window slides
//! 2. Circuit breaker: trips after the failure threshold, rejects while
//!    OPEN, recovers through HALF_OPEN on successes
//! 3. Token bucket: full burst, denial when drained, refill while idle
//! 4. Store outage: limiters fail open and count the error

use std::sync::Arc;
use std::time::Duration;

use grund_core::connections::memory::InMemoryKv;
use grund_core::errors::{ErrorCategory, ServiceError};
use grund_core::metrics::MetricsRegistry;
use grund_core::resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, RateLimitAlgorithm, RateLimitConfig,
    RateLimiter,
};

fn limiter(config: RateLimitConfig) -> (Arc<MetricsRegistry>, RateLimiter, Arc<InMemoryKv>) {
    let metrics = Arc::new(MetricsRegistry::new());
    let kv = Arc::new(InMemoryKv::new());
    let limiter = RateLimiter::new(config, Some(kv.clone()), &metrics);
    (metrics, limiter, kv)
}

// ============================================================================
// SLIDING WINDOW
// ============================================================================

/// Test: sliding_window_documented_scenario
///
/// Limit 3 / window 60s. Submissions at t=0, 10, 20 are accepted, the
/// one at t=30 is denied with a retry hint of roughly 30s, and a
/// submission at t=61 is accepted once the first has left the window.
#[tokio::test]
async fn test_sliding_window_documented_scenario() {
    let (_metrics, limiter, _kv) =
        limiter(RateLimitConfig::new("orders", 3, Duration::from_secs(60)));
    let t0 = 1_700_000_000.0;

    assert!(limiter.check_at("acct", t0).await.allowed);
    assert!(limiter.check_at("acct", t0 + 10.0).await.allowed);
    assert!(limiter.check_at("acct", t0 + 20.0).await.allowed);

    let denied = limiter.check_at("acct", t0 + 30.0).await;
    assert!(!denied.allowed);
    let retry_after = denied.retry_after.unwrap();
    assert!(
        (29..=31).contains(&retry_after),
        "retry_after {} outside expected band",
        retry_after
    );

    assert!(limiter.check_at("acct", t0 + 61.0).await.allowed);
}

/// Test: sliding_window_isolates_keys
#[tokio::test]
async fn test_sliding_window_isolates_keys() {
    let (_metrics, limiter, _kv) =
        limiter(RateLimitConfig::new("orders", 1, Duration::from_secs(60)));
    let t0 = 1_700_000_000.0;

    assert!(limiter.check_at("alpha", t0).await.allowed);
    assert!(!limiter.check_at("alpha", t0 + 1.0).await.allowed);
    assert!(limiter.check_at("beta", t0 + 1.0).await.allowed);
}

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

/// Test: breaker_documented_scenario
///
/// Threshold 3: three failures trip the breaker, a call while OPEN is
/// rejected without running, the recovery timeout admits a HALF_OPEN
/// probe, and two successes close it again.
#[tokio::test]
async fn test_breaker_documented_scenario() {
    let metrics = MetricsRegistry::new();
    let breaker = CircuitBreaker::new(
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            recovery_timeout: Duration::from_millis(50),
            ..CircuitBreakerConfig::new("scenario")
        },
        &metrics,
    );

    for _ in 0..3 {
        let result: Result<(), ServiceError> = breaker
            .call(|| async { Err(ServiceError::network("backend down")) })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // While OPEN the operation must not run.
    let mut invoked = false;
    let rejected: Result<(), ServiceError> = breaker
        .call(|| {
            invoked = true;
            async { Ok(()) }
        })
        .await;
    let err = rejected.unwrap_err();
    assert_eq!(err.category, ErrorCategory::ExternalApi);
    assert!(!invoked);

    // After the recovery timeout a probe is allowed.
    std::thread::sleep(Duration::from_millis(60));
    assert!(breaker.is_call_permitted());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::Closed);
}

/// Test: breaker_failure_in_half_open_reopens
#[tokio::test]
async fn test_breaker_failure_in_half_open_reopens() {
    let metrics = MetricsRegistry::new();
    let breaker = CircuitBreaker::new(
        CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(20),
            ..CircuitBreakerConfig::new("reopen")
        },
        &metrics,
    );

    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);
    std::thread::sleep(Duration::from_millis(30));
    assert!(breaker.is_call_permitted());
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);
}

// ============================================================================
// TOKEN BUCKET
// ============================================================================

/// Test: token_bucket_documented_scenario
///
/// Capacity 10, refill 1/s, starting full: ten immediate calls pass,
/// the eleventh is denied with a roughly one second retry hint, and
/// five seconds of idle refill five more tokens.
#[tokio::test]
async fn test_token_bucket_documented_scenario() {
    let (_metrics, limiter, _kv) = limiter(
        RateLimitConfig::new("burst", 10, Duration::from_secs(10))
            .with_algorithm(RateLimitAlgorithm::TokenBucket),
    );
    let t0 = 1_700_000_000.0;

    for i in 0..10 {
        assert!(
            limiter.check_at("acct", t0).await.allowed,
            "call {} should pass on a full bucket",
            i
        );
    }

    let denied = limiter.check_at("acct", t0).await;
    assert!(!denied.allowed);
    let retry_after = denied.retry_after.unwrap();
    assert!(
        (1..=2).contains(&retry_after),
        "retry_after {} outside expected band",
        retry_after
    );

    // Five seconds idle refills five tokens at 1/s.
    for i in 0..5 {
        assert!(
            limiter.check_at("acct", t0 + 5.0).await.allowed,
            "call {} should pass after refill",
            i
        );
    }
    assert!(!limiter.check_at("acct", t0 + 5.0).await.allowed);
}

// ============================================================================
// STORE OUTAGE
// ============================================================================

/// Test: limiter_fails_open_on_store_outage
///
/// When the key-value store errors, the limiter admits the request and
/// counts the failure instead of blocking traffic.
#[tokio::test]
async fn test_limiter_fails_open_on_store_outage() {
    let (metrics, limiter, kv) =
        limiter(RateLimitConfig::new("outage", 1, Duration::from_secs(60)));
    let t0 = 1_700_000_000.0;

    assert!(limiter.check_at("acct", t0).await.allowed);
    kv.set_failing(true);

    // Over the limit, but the store is down: admitted anyway.
    let decision = limiter.check_at("acct", t0 + 1.0).await;
    assert!(decision.allowed);
    assert_eq!(
        metrics.latest("rate_limit_errors_total", &[("limiter", "outage")]),
        Some(1.0)
    );

    // Store recovery restores enforcement.
    kv.set_failing(false);
    assert!(!limiter.check_at("acct", t0 + 2.0).await.allowed);
}
