//! Resilience primitives for calls to flaky infrastructure
//!
//! Provides circuit breakers, retry policies with configurable backoff,
//! rate limiting over a key-value store, and graceful degradation that
//! derives an operation mode from backend health.

pub mod circuit_breaker;
pub mod degradation;
pub mod rate_limit;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats, CircuitState,
};
pub use degradation::{DegradationManager, OperationMode, OperationResult};
pub use rate_limit::{
    RateLimitAlgorithm, RateLimitConfig, RateLimitDecision, RateLimiter, RateLimiterManager,
};
pub use retry::{
    BackoffStrategy, RetryAttempt, RetryConfig, RetryExhausted, RetryPolicy, RetryPolicyBuilder,
    RetryPolicyRegistry,
};
