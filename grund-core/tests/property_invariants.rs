//! Property-based tests for the resilience and metrics invariants
//!
//! These tests use proptest to verify the documented invariants across
//! thousands of randomized inputs, catching edge cases that unit tests miss:
//! counter accumulation, breaker trip behavior, rate-limit window bounds,
//! token-bucket burst/refill arithmetic, backoff schedules, and histogram
//! statistics.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use grund_core::connections::memory::InMemoryKv;
use grund_core::metrics::MetricsRegistry;
use grund_core::resilience::{
    BackoffStrategy, CircuitBreaker, CircuitBreakerConfig, CircuitState, RateLimitAlgorithm,
    RateLimitConfig, RateLimiter, RetryConfig, RetryPolicy,
};

fn test_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("failed to build test runtime")
}

/// Property: a counter's value equals the sum of its deltas
///
/// For any sequence of non-negative increments, the final counter value
/// is the sum of the deltas, and the running value never decreases.
#[test]
fn prop_counter_accumulates_and_is_monotonic() {
    proptest!(|(deltas in proptest::collection::vec(0.0..1000.0_f64, 1..50))| {
        let metrics = MetricsRegistry::new();
        let counter = metrics.counter("prop_counter", &[]);

        let mut expected = 0.0;
        let mut previous = counter.value();
        for delta in &deltas {
            counter.add(*delta);
            expected += delta;
            let current = counter.value();
            prop_assert!(current >= previous, "counter moved backwards: {} -> {}", previous, current);
            previous = current;
        }
        prop_assert!((counter.value() - expected).abs() < 1e-6,
            "final value {} != sum of deltas {}", counter.value(), expected);
    });
}

/// Property: the breaker opens at the failure threshold and rejects
///
/// After exactly `threshold` consecutive recorded failures the breaker
/// is OPEN, and while the recovery timeout has not elapsed no further
/// call is permitted.
#[test]
fn prop_breaker_opens_at_threshold_and_rejects() {
    proptest!(|(threshold in 1..10_u64, extra_failures in 0..5_u64)| {
        let metrics = MetricsRegistry::new();
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig {
                failure_threshold: threshold,
                failure_window: Duration::from_secs(3600),
                recovery_timeout: Duration::from_secs(3600),
                ..CircuitBreakerConfig::new("prop_breaker")
            },
            &metrics,
        );

        for i in 0..threshold - 1 {
            breaker.record_failure();
            prop_assert_eq!(breaker.state(), CircuitState::Closed,
                "opened early after {} of {} failures", i + 1, threshold);
        }
        breaker.record_failure();
        prop_assert_eq!(breaker.state(), CircuitState::Open);
        prop_assert!(!breaker.is_call_permitted());

        // Further failures keep it open; still no permit inside recovery.
        for _ in 0..extra_failures {
            breaker.record_failure();
        }
        prop_assert_eq!(breaker.state(), CircuitState::Open);
        prop_assert!(!breaker.is_call_permitted());
    });
}

/// Property: sliding-window accepted count never exceeds the limit
///
/// For any request schedule, the number of accepted requests whose
/// timestamps fall inside any trailing window of length W is at most
/// the configured limit.
#[test]
fn prop_sliding_window_bounded_by_limit() {
    proptest!(|(
        limit in 1..8_u64,
        window_secs in 5..120_u64,
        gaps in proptest::collection::vec(0.0..30.0_f64, 1..60),
    )| {
        let rt = test_runtime();
        rt.block_on(async {
            let metrics = MetricsRegistry::new();
            let kv = Arc::new(InMemoryKv::new());
            let limiter = RateLimiter::new(
                RateLimitConfig::new("prop_sliding", limit, Duration::from_secs(window_secs)),
                Some(kv),
                &metrics,
            );

            let window = window_secs as f64;
            let mut now = 1_700_000_000.0;
            let mut accepted: Vec<f64> = Vec::new();
            for gap in &gaps {
                now += gap;
                let decision = limiter.check_at("principal", now).await;
                if decision.allowed {
                    accepted.push(now);
                }
                let in_window = accepted.iter().filter(|ts| **ts > now - window).count() as u64;
                prop_assert!(in_window <= limit,
                    "{} accepted inside one window, limit {}", in_window, limit);
            }
            Ok(())
        })?;
    });
}

/// Property: token bucket burst is bounded by capacity, refill by rate
///
/// Starting from a full bucket, exactly `capacity` immediate requests
/// are accepted and the next is denied; after an idle period, the number
/// of additional accepted requests is the whole tokens refilled, capped
/// at capacity.
#[test]
fn prop_token_bucket_burst_and_refill() {
    proptest!(|(capacity in 1..15_u64, idle_secs in 1..40_u64)| {
        let rt = test_runtime();
        rt.block_on(async {
            // max_requests == capacity over `capacity` seconds: 1 token/sec.
            let metrics = MetricsRegistry::new();
            let kv = Arc::new(InMemoryKv::new());
            let limiter = RateLimiter::new(
                RateLimitConfig::new("prop_bucket", capacity, Duration::from_secs(capacity))
                    .with_algorithm(RateLimitAlgorithm::TokenBucket),
                Some(kv),
                &metrics,
            );

            let t0 = 1_700_000_000.0;
            for i in 0..capacity {
                let decision = limiter.check_at("principal", t0).await;
                prop_assert!(decision.allowed, "burst request {} of {} denied", i + 1, capacity);
            }
            let denied = limiter.check_at("principal", t0).await;
            prop_assert!(!denied.allowed, "request beyond capacity {} accepted", capacity);

            // Refill at 1 token/sec while idle, never above capacity.
            let refilled = idle_secs.min(capacity);
            let t1 = t0 + idle_secs as f64;
            for i in 0..refilled {
                let decision = limiter.check_at("principal", t1).await;
                prop_assert!(decision.allowed, "refilled request {} of {} denied", i + 1, refilled);
            }
            let drained = limiter.check_at("principal", t1).await;
            prop_assert!(!drained.allowed, "bucket served more than the refilled tokens");
            Ok(())
        })?;
    });
}

/// Property: backoff delays follow the configured schedule
///
/// Without jitter, the delay for attempt n is the strategy's closed
/// form clamped to max_delay, and the schedule is non-decreasing.
#[test]
fn prop_backoff_schedule_is_deterministic() {
    proptest!(|(
        base_ms in 10..2000_u64,
        max_ms in 2000..60_000_u64,
        multiplier in 1.5..4.0_f64,
        strategy_pick in 0..4_usize,
    )| {
        let strategy = match strategy_pick {
            0 => BackoffStrategy::Fixed,
            1 => BackoffStrategy::Linear,
            2 => BackoffStrategy::Exponential,
            _ => BackoffStrategy::Polynomial,
        };
        let metrics = MetricsRegistry::new();
        let policy = RetryPolicy::new(
            RetryConfig {
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(max_ms),
                backoff_strategy: strategy,
                backoff_multiplier: multiplier,
                jitter: false,
                ..RetryConfig::new("prop_backoff")
            },
            &metrics,
        );

        let base = base_ms as f64 / 1000.0;
        let cap = max_ms as f64 / 1000.0;
        let mut previous = 0.0;
        for attempt in 1..=8_u32 {
            let expected = match strategy {
                BackoffStrategy::Fixed => base,
                BackoffStrategy::Linear => base * attempt as f64,
                BackoffStrategy::Exponential => base * multiplier.powi(attempt as i32 - 1),
                BackoffStrategy::Polynomial => base * (attempt as f64).powf(multiplier),
            }
            .min(cap);
            let actual = policy.delay_for_attempt(attempt).as_secs_f64();
            prop_assert!((actual - expected).abs() < 1e-9,
                "attempt {}: delay {} != expected {}", attempt, actual, expected);
            prop_assert!(actual + 1e-9 >= previous, "schedule decreased at attempt {}", attempt);
            previous = actual;
        }
    });
}

/// Property: histogram statistics are consistent with the observations
///
/// Count equals the number of observations, sum matches, and the order
/// statistics sit inside [min, max] with min <= median <= max and
/// min <= mean <= max.
#[test]
fn prop_histogram_stats_consistent() {
    proptest!(|(values in proptest::collection::vec(0.0..10_000.0_f64, 1..200))| {
        let metrics = MetricsRegistry::new();
        let histogram = metrics.histogram("prop_histogram", &[]);
        for value in &values {
            histogram.observe(*value);
        }

        let stats = histogram.stats().expect("stats for populated histogram");
        let expected_sum: f64 = values.iter().sum();
        let expected_min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let expected_max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

        prop_assert_eq!(stats.count, values.len() as u64);
        prop_assert!((stats.sum - expected_sum).abs() < 1e-6);
        prop_assert!((stats.min - expected_min).abs() < 1e-9);
        prop_assert!((stats.max - expected_max).abs() < 1e-9);
        prop_assert!(stats.min <= stats.mean && stats.mean <= stats.max);
        prop_assert!(stats.min <= stats.median && stats.median <= stats.max);
        prop_assert!(stats.min <= stats.p95 && stats.p95 <= stats.max);
        prop_assert!(stats.p95 <= stats.p99 || (stats.p99 - stats.p95).abs() < 1e-9);
        prop_assert!(stats.stddev >= 0.0);
    });
}
