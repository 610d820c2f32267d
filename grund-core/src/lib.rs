//! Grund Core - Shared infrastructure for trading microservices
//!
//! Grund is the runtime substrate every service in the platform links
//! against: metrics, resilience primitives, backend connection
//! management, health reporting, alerting, and trading-limit
//! enforcement, wired together by a single bootstrap façade.
//!
//! ## Architecture
//! - **Process-local state** guarded by per-entity locks; no hidden globals
//! - **Cooperative background tasks** with watch-channel stop signals
//! - **Fail-open rate limiting**, fail-closed limit validation
//! - **Circuit breakers** on every backend handle
//! - **Explicit time**: hot paths take a timestamp so tests never sleep
//!
//! ## Core Modules
//! - `metrics`: counters, gauges, histograms with a textual export
//! - `resilience`: circuit breakers, retries, rate limiters, degradation
//! - `connections`: backend clients, probing, in-memory fallbacks
//! - `health`: component checks aggregated worst-first
//! - `alerting`: rule evaluation, dedup, channel fan-out
//! - `limits`: pre-trade validation against per-account trading limits
//! - `runtime`: one-call service bootstrap and shutdown

pub mod alerting;
pub mod config;
pub mod connections;
pub mod errors;
pub mod health;
pub mod limits;
pub mod metrics;
pub mod resilience;
pub mod runtime;
pub mod server;
pub mod utils;

// Re-export the types almost every service touches
pub use config::{BackendKind, Config, DeploymentEnv};
pub use errors::{ErrorCategory, ErrorContext, ErrorSeverity, ServiceError};
pub use runtime::ServiceRuntime;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::alerting::{AlertEngine, AlertRule, AlertSeverity};
    pub use crate::config::{BackendKind, Config, DeploymentEnv};
    pub use crate::connections::{BackendStatus, ConnectionManager};
    pub use crate::errors::{ErrorCategory, ErrorSeverity, ServiceError};
    pub use crate::health::{HealthRegistry, HealthStatus};
    pub use crate::limits::{
        AccountScope, TradingAction, TradingLimit, TradingLimitValidator, ValidationResult,
    };
    pub use crate::metrics::{MetricsRegistry, TradeMetrics};
    pub use crate::resilience::{
        CircuitBreaker, CircuitBreakerRegistry, RateLimiterManager, RetryPolicy,
        RetryPolicyRegistry,
    };
    pub use crate::runtime::ServiceRuntime;
    pub use crate::utils::init_logging;
}
