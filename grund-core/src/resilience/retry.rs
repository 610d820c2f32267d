//! Bounded retries with pluggable backoff.
//!
//! A policy runs an async operation up to `max_attempts` times, waiting
//! between attempts according to the backoff strategy (clamped to
//! `max_delay`, then jittered). Errors whose category is marked
//! non-retryable stop the loop immediately. The terminal error is
//! [`RetryExhausted`], which carries the full attempt history.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::errors::{ErrorCategory, ErrorContext, ServiceError};
use crate::metrics::{Counter, Histogram, MetricsRegistry};
use crate::utils::time::unix_secs_f64;

/// Backoff strategies for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
    Polynomial,
}

/// Configuration for retry policies.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub name: String,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_strategy: BackoffStrategy,
    /// Exponential base, or the polynomial power.
    pub backoff_multiplier: f64,
    pub jitter: bool,
    /// Maximum jitter as a fraction of the computed delay.
    pub jitter_max: f64,
    /// Error categories worth retrying; `None` retries everything.
    pub retryable: Option<Vec<ErrorCategory>>,
    /// Error categories that terminate immediately; checked first.
    pub non_retryable: Vec<ErrorCategory>,
}

impl RetryConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_strategy: BackoffStrategy::Exponential,
            backoff_multiplier: 2.0,
            jitter: true,
            jitter_max: 0.1,
            retryable: None,
            non_retryable: Vec::new(),
        }
    }

    /// Relational store access: quick exponential retries.
    pub fn database() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            ..Self::new("database")
        }
    }

    /// Third-party HTTP APIs.
    pub fn external_api() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            ..Self::new("external_api")
        }
    }

    /// Order gateway calls: one cautious retry with a steep backoff.
    pub fn order_gateway() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 3.0,
            ..Self::new("order_gateway")
        }
    }

    /// Key-value cache: short linear retries.
    pub fn cache() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_strategy: BackoffStrategy::Linear,
            ..Self::new("cache")
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new("retry_policy")
    }
}

/// Information about one attempt inside a retry loop.
#[derive(Debug, Clone, Serialize)]
pub struct RetryAttempt {
    pub attempt_number: u32,
    pub error: String,
    /// Wait applied after this attempt; zero for the terminal attempt.
    pub delay_secs: f64,
    /// Unix seconds.
    pub timestamp: f64,
    pub total_elapsed_secs: f64,
}

/// All attempts failed (or a non-retryable error ended the loop).
#[derive(Debug, Error)]
#[error("retry policy '{policy}' exhausted after {attempts_made} attempts")]
pub struct RetryExhausted {
    pub policy: String,
    pub attempts_made: u32,
    pub attempts: Vec<RetryAttempt>,
    pub last_error: ServiceError,
}

impl From<RetryExhausted> for ServiceError {
    fn from(err: RetryExhausted) -> Self {
        let category = err.last_error.category;
        let context = ErrorContext::new().with_extra(
            "retry_attempts",
            serde_json::to_value(&err.attempts).unwrap_or(serde_json::Value::Null),
        );
        ServiceError::new(category, "RETRY_EXHAUSTED", err.to_string())
            .with_context(context)
            .with_source(err.last_error)
    }
}

/// Retry policy with configurable backoff.
pub struct RetryPolicy {
    config: RetryConfig,
    attempts_counter: Counter,
    success_counter: Counter,
    exhausted_counter: Counter,
    delay_histogram: Histogram,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig, metrics: &MetricsRegistry) -> Self {
        let policy_tag = [("policy", config.name.as_str())];
        Self {
            attempts_counter: metrics.counter("retry_attempts_total", &policy_tag),
            success_counter: metrics.counter("retry_success_total", &policy_tag),
            exhausted_counter: metrics.counter("retry_exhausted_total", &policy_tag),
            delay_histogram: metrics.histogram("retry_delay_seconds", &policy_tag),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Backoff delay for `attempt` (1-based), clamped to `max_delay`,
    /// before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay.as_secs_f64();
        let raw = match self.config.backoff_strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base * attempt as f64,
            BackoffStrategy::Exponential => {
                base * self.config.backoff_multiplier.powi(attempt as i32 - 1)
            }
            BackoffStrategy::Polynomial => {
                base * (attempt as f64).powf(self.config.backoff_multiplier)
            }
        };
        Duration::from_secs_f64(raw.min(self.config.max_delay.as_secs_f64()))
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if !self.config.jitter {
            return delay;
        }
        let jitter = delay.as_secs_f64() * self.config.jitter_max * rand::thread_rng().gen::<f64>();
        delay + Duration::from_secs_f64(jitter)
    }

    fn is_retryable(&self, category: ErrorCategory) -> bool {
        if self.config.non_retryable.contains(&category) {
            return false;
        }
        match &self.config.retryable {
            Some(retryable) => retryable.contains(&category),
            None => true,
        }
    }

    /// Run `operation` until it succeeds, a non-retryable error occurs, or
    /// the attempt budget is spent.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, RetryExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let mut attempts: Vec<RetryAttempt> = Vec::new();
        let started = Instant::now();
        let max_attempts = self.config.max_attempts.max(1);

        for attempt_num in 1..=max_attempts {
            self.attempts_counter.increment();

            match operation().await {
                Ok(value) => {
                    if attempt_num > 1 {
                        self.success_counter.increment();
                        info!(
                            policy = %self.config.name,
                            attempts = attempt_num,
                            total_elapsed_ms = started.elapsed().as_millis() as u64,
                            "operation succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let elapsed = started.elapsed();
                    attempts.push(RetryAttempt {
                        attempt_number: attempt_num,
                        error: err.to_string(),
                        delay_secs: 0.0,
                        timestamp: unix_secs_f64(),
                        total_elapsed_secs: elapsed.as_secs_f64(),
                    });

                    if attempt_num >= max_attempts || !self.is_retryable(err.category) {
                        self.exhausted_counter.increment();
                        error!(
                            policy = %self.config.name,
                            attempts = attempt_num,
                            category = %err.category,
                            last_error = %err,
                            "retry exhausted"
                        );
                        return Err(RetryExhausted {
                            policy: self.config.name.clone(),
                            attempts_made: attempt_num,
                            attempts,
                            last_error: err,
                        });
                    }

                    let delay = self.jittered_delay(attempt_num);
                    if let Some(last) = attempts.last_mut() {
                        last.delay_secs = delay.as_secs_f64();
                    }
                    self.delay_histogram.observe(delay.as_secs_f64());
                    warn!(
                        policy = %self.config.name,
                        attempt = attempt_num,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        unreachable!("retry loop always returns")
    }
}

/// Fluent builder for retry policies.
pub struct RetryPolicyBuilder {
    config: RetryConfig,
}

impl RetryPolicyBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: RetryConfig::new(name),
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts.max(1);
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn exponential_backoff(mut self, multiplier: f64) -> Self {
        self.config.backoff_strategy = BackoffStrategy::Exponential;
        self.config.backoff_multiplier = multiplier;
        self
    }

    pub fn linear_backoff(mut self) -> Self {
        self.config.backoff_strategy = BackoffStrategy::Linear;
        self
    }

    pub fn fixed_backoff(mut self) -> Self {
        self.config.backoff_strategy = BackoffStrategy::Fixed;
        self
    }

    pub fn polynomial_backoff(mut self, power: f64) -> Self {
        self.config.backoff_strategy = BackoffStrategy::Polynomial;
        self.config.backoff_multiplier = power;
        self
    }

    pub fn with_jitter(mut self, jitter_max: f64) -> Self {
        self.config.jitter = true;
        self.config.jitter_max = jitter_max;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.config.jitter = false;
        self
    }

    pub fn retryable(mut self, categories: &[ErrorCategory]) -> Self {
        self.config.retryable = Some(categories.to_vec());
        self
    }

    pub fn non_retryable(mut self, categories: &[ErrorCategory]) -> Self {
        self.config.non_retryable = categories.to_vec();
        self
    }

    pub fn build(self, metrics: &MetricsRegistry) -> RetryPolicy {
        RetryPolicy::new(self.config, metrics)
    }
}

/// Named policy registry.
pub struct RetryPolicyRegistry {
    policies: DashMap<String, Arc<RetryPolicy>>,
    metrics: Arc<MetricsRegistry>,
}

impl RetryPolicyRegistry {
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            policies: DashMap::new(),
            metrics,
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<RetryPolicy> {
        self.get_or_create_with(RetryConfig::new(name))
    }

    /// Get or create; an existing policy keeps its original configuration.
    pub fn get_or_create_with(&self, config: RetryConfig) -> Arc<RetryPolicy> {
        let name = config.name.clone();
        self.policies
            .entry(name)
            .or_insert_with(|| {
                info!(policy = %config.name, "created retry policy");
                Arc::new(RetryPolicy::new(config, &self.metrics))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<RetryPolicy>> {
        self.policies.get(name).map(|entry| entry.clone())
    }

    pub fn remove(&self, name: &str) -> bool {
        self.policies.remove(name).is_some()
    }
}
