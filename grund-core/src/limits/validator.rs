//! Trading action validation against the active limit set.
//!
//! The final gate before an order reaches a broker. Hard violations
//! deny the action and leave a breach record behind; soft violations
//! let it through with a warning. Validation itself never consumes
//! usage, callers report fills through
//! [`TradingLimitValidator::update_usage_after_trade`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, error, info, warn};

use super::store::LimitStore;
use super::{
    ActionKind, BreachSeverity, BreachStatus, LimitBreach, LimitEnforcement, LimitType,
    LimitViolation, TradingAction, TradingLimit, ValidationResult,
};
use crate::alerting::{AlertEngine, AlertSeverity};
use crate::errors::ServiceError;
use crate::metrics::MetricsRegistry;

/// Who is acting and where.
#[derive(Debug, Clone, Copy)]
pub struct AccountScope {
    pub user_id: u64,
    pub account_id: u64,
    pub org_id: u64,
}

/// Source of open-position counts for `max_open_positions` checks.
/// Backed by the positions service in production.
#[async_trait]
pub trait PositionsProvider: Send + Sync {
    async fn open_positions(&self, user_id: u64, account_id: u64) -> Result<u64, ServiceError>;
}

pub struct TradingLimitValidator {
    store: Arc<dyn LimitStore>,
    metrics: Arc<MetricsRegistry>,
    positions: Option<Arc<dyn PositionsProvider>>,
    alerts: Option<Arc<AlertEngine>>,
}

impl TradingLimitValidator {
    pub fn new(store: Arc<dyn LimitStore>, metrics: Arc<MetricsRegistry>) -> Self {
        metrics.describe("limit_checks_total", "Trading actions validated against limits");
        metrics.describe("limit_violations_total", "Limit violations detected");
        metrics.describe("limit_breaches_total", "Hard limit breaches recorded");
        Self {
            store,
            metrics,
            positions: None,
            alerts: None,
        }
    }

    pub fn with_positions_provider(mut self, provider: Arc<dyn PositionsProvider>) -> Self {
        self.positions = Some(provider);
        self
    }

    pub fn with_alert_engine(mut self, alerts: Arc<AlertEngine>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Validate an action against every applicable limit. Any internal
    /// failure denies the action; limits fail closed.
    pub async fn validate(&self, scope: AccountScope, action: &TradingAction) -> ValidationResult {
        self.metrics.counter("limit_checks_total", &[]).increment();
        match self.run_validation(scope, action).await {
            Ok(result) => result,
            Err(err) => {
                error!(
                    user_id = scope.user_id,
                    account_id = scope.account_id,
                    error = %err,
                    "limit validation failed"
                );
                ValidationResult {
                    allowed: false,
                    message: Some(format!("limit validation failed: {}", err)),
                    ..ValidationResult::default()
                }
            }
        }
    }

    async fn run_validation(
        &self,
        scope: AccountScope,
        action: &TradingAction,
    ) -> Result<ValidationResult, ServiceError> {
        let mut result = ValidationResult::default();
        let limits = self
            .store
            .active_limits(scope.user_id, scope.account_id, action.strategy_id)
            .await?;
        if limits.is_empty() {
            debug!(user_id = scope.user_id, "no trading limits configured");
            return Ok(result);
        }

        for mut limit in limits {
            if limit.reset_due(action.at) {
                limit.reset_usage(action.at);
                self.store.save_limit(&limit).await?;
                info!(
                    limit_id = limit.id,
                    limit_type = limit.limit_type.as_str(),
                    "limit usage reset"
                );
            }

            match self.check_limit(&limit, action).await? {
                Some(violation) => {
                    self.metrics
                        .counter(
                            "limit_violations_total",
                            &[("type", limit.limit_type.as_str())],
                        )
                        .increment();
                    match limit.enforcement {
                        LimitEnforcement::Hard => {
                            result.allowed = false;
                            let breach = self
                                .record_breach(scope, &mut limit, action, &violation)
                                .await?;
                            for act in &breach.actions_taken {
                                if !result.required_actions.contains(act) {
                                    result.required_actions.push(*act);
                                }
                            }
                            if limit.override_allowed {
                                result.override_possible = true;
                            }
                            if limit.notify_on_breach {
                                self.send_breach_alert(scope, &limit, &violation).await;
                            }
                            result.breaches.push(breach);
                            result.violations.push(violation);
                        }
                        LimitEnforcement::Soft => {
                            warn!(
                                limit_id = limit.id,
                                message = %violation.message,
                                "soft limit exceeded"
                            );
                            result.warnings.push(violation);
                        }
                        LimitEnforcement::Advisory => {
                            info!(
                                limit_id = limit.id,
                                message = %violation.message,
                                "advisory limit exceeded"
                            );
                        }
                    }
                }
                None => {
                    if limit.should_warn() {
                        result.warnings.push(LimitViolation {
                            limit_id: limit.id,
                            limit_type: limit.limit_type,
                            message: format!(
                                "approaching {}: {}% of limit used",
                                limit.limit_type,
                                limit.usage_percentage().round_dp(1)
                            ),
                            limit_value: limit.limit_value,
                            limit_count: limit.limit_count,
                            attempted_value: None,
                            current_usage: Some(limit.usage_value),
                            breach_amount: None,
                        });
                    }
                }
            }
        }

        if !result.allowed {
            let messages: Vec<&str> = result
                .violations
                .iter()
                .map(|v| v.message.as_str())
                .collect();
            result.message = Some(messages.join("; "));
        }
        Ok(result)
    }

    async fn check_limit(
        &self,
        limit: &TradingLimit,
        action: &TradingAction,
    ) -> Result<Option<LimitViolation>, ServiceError> {
        let violation = match limit.limit_type {
            LimitType::DailyTradingLimit => check_daily_trading_value(limit, action)?,
            LimitType::SingleTradeLimit => check_single_trade_value(limit, action)?,
            LimitType::DailyOrderCount => check_daily_order_count(limit)?,
            LimitType::AllowedInstruments => check_allowed_instruments(limit, action),
            LimitType::BlockedInstruments => check_blocked_instruments(limit, action),
            LimitType::TradingHours => check_trading_hours(limit, action),
            LimitType::SingleOrderQuantity => check_single_order_quantity(limit, action)?,
            LimitType::MaxOpenPositions => self.check_max_open_positions(limit, action).await?,
            other => {
                debug!(
                    limit_id = limit.id,
                    limit_type = other.as_str(),
                    "no dedicated check for limit type"
                );
                None
            }
        };
        Ok(violation)
    }

    async fn check_max_open_positions(
        &self,
        limit: &TradingLimit,
        action: &TradingAction,
    ) -> Result<Option<LimitViolation>, ServiceError> {
        if action.kind != ActionKind::PlaceOrder {
            return Ok(None);
        }
        let provider = match &self.positions {
            Some(provider) => provider,
            None => {
                debug!(
                    limit_id = limit.id,
                    "no positions provider configured, skipping max open positions check"
                );
                return Ok(None);
            }
        };
        let bound = bound_count(limit)?;
        let current = provider
            .open_positions(limit.user_id, limit.account_id)
            .await?;
        if current >= bound {
            return Ok(Some(LimitViolation {
                limit_id: limit.id,
                limit_type: limit.limit_type,
                message: format!(
                    "maximum open positions limit of {} reached (current {})",
                    bound, current
                ),
                limit_value: None,
                limit_count: Some(bound),
                attempted_value: None,
                current_usage: Some(Decimal::from(current)),
                breach_amount: None,
            }));
        }
        Ok(None)
    }

    async fn record_breach(
        &self,
        scope: AccountScope,
        limit: &mut TradingLimit,
        action: &TradingAction,
        violation: &LimitViolation,
    ) -> Result<LimitBreach, ServiceError> {
        // Severity uses the count of breaches before this one.
        let severity =
            BreachSeverity::classify(violation.breach_percentage(), limit.consecutive_breaches);
        let mut breach = LimitBreach {
            id: 0,
            user_id: scope.user_id,
            account_id: scope.account_id,
            org_id: scope.org_id,
            limit_id: limit.id,
            breach_type: limit.limit_type,
            severity,
            status: BreachStatus::Detected,
            limit_value: violation.limit_value,
            attempted_value: violation.attempted_value,
            current_usage: violation.current_usage,
            breach_amount: violation.breach_amount,
            action_attempted: action.kind,
            instrument: action.instrument.clone(),
            reason: violation.message.clone(),
            actions_taken: severity.required_actions(),
            at: action.at,
            resolved_at: None,
        };
        breach.id = self.store.record_breach(&breach).await?;

        limit.breach_count += 1;
        limit.consecutive_breaches += 1;
        limit.last_breach_at = Some(action.at);
        self.store.save_limit(limit).await?;

        self.metrics
            .counter("limit_breaches_total", &[("severity", severity.as_str())])
            .increment();
        warn!(
            breach_id = breach.id,
            breach_type = breach.breach_type.as_str(),
            severity = severity.as_str(),
            user_id = scope.user_id,
            "trading limit breach detected"
        );
        Ok(breach)
    }

    async fn send_breach_alert(
        &self,
        scope: AccountScope,
        limit: &TradingLimit,
        violation: &LimitViolation,
    ) {
        let engine = match &self.alerts {
            Some(engine) => engine,
            None => return,
        };
        let percentage = violation.breach_percentage();
        let severity = if percentage > dec!(50) {
            AlertSeverity::Critical
        } else if percentage > dec!(25) {
            AlertSeverity::High
        } else {
            AlertSeverity::Medium
        };

        let mut labels = HashMap::new();
        labels.insert("user_id".to_string(), scope.user_id.to_string());
        labels.insert("org_id".to_string(), scope.org_id.to_string());
        labels.insert(
            "limit_type".to_string(),
            limit.limit_type.as_str().to_string(),
        );
        if let Some(amount) = violation.breach_amount {
            labels.insert("breach_amount".to_string(), amount.to_string());
        }
        if let Some(value) = violation.limit_value {
            labels.insert("limit_value".to_string(), value.to_string());
        }
        if let Some(usage) = violation.current_usage {
            labels.insert("current_usage".to_string(), usage.to_string());
        }

        let name = format!(
            "trading_limit_breach_{}_{}",
            limit.limit_type.as_str(),
            scope.user_id
        );
        engine
            .emit(&name, severity, &violation.message, labels)
            .await;
    }

    /// Consume usage after a fill. Clears consecutive-breach counters
    /// on every applicable limit.
    pub async fn update_usage_after_trade(
        &self,
        scope: AccountScope,
        action: &TradingAction,
    ) -> Result<(), ServiceError> {
        let limits = self
            .store
            .active_limits(scope.user_id, scope.account_id, action.strategy_id)
            .await?;
        for mut limit in limits {
            match limit.limit_type {
                LimitType::DailyTradingLimit | LimitType::MonthlyTradingLimit => {
                    limit.usage_value += action.trade_value;
                }
                LimitType::DailyOrderCount => {
                    limit.usage_count += 1;
                }
                _ => {}
            }
            limit.consecutive_breaches = 0;
            self.store.save_limit(&limit).await?;
        }
        debug!(user_id = scope.user_id, "usage counters updated after trade");
        Ok(())
    }
}

fn bound_value(limit: &TradingLimit) -> Result<Decimal, ServiceError> {
    limit.limit_value.ok_or_else(|| {
        ServiceError::validation(format!(
            "limit {} ({}) has no limit_value",
            limit.id, limit.limit_type
        ))
    })
}

fn bound_count(limit: &TradingLimit) -> Result<u64, ServiceError> {
    limit.limit_count.ok_or_else(|| {
        ServiceError::validation(format!(
            "limit {} ({}) has no limit_count",
            limit.id, limit.limit_type
        ))
    })
}

fn check_daily_trading_value(
    limit: &TradingLimit,
    action: &TradingAction,
) -> Result<Option<LimitViolation>, ServiceError> {
    let bound = bound_value(limit)?;
    let projected = limit.usage_value + action.trade_value;
    if projected > bound {
        return Ok(Some(LimitViolation {
            limit_id: limit.id,
            limit_type: limit.limit_type,
            message: format!(
                "daily trading limit of {} would be exceeded (current usage {}, attempted {})",
                bound, limit.usage_value, action.trade_value
            ),
            limit_value: Some(bound),
            limit_count: None,
            attempted_value: Some(action.trade_value),
            current_usage: Some(limit.usage_value),
            breach_amount: Some(projected - bound),
        }));
    }
    Ok(None)
}

fn check_single_trade_value(
    limit: &TradingLimit,
    action: &TradingAction,
) -> Result<Option<LimitViolation>, ServiceError> {
    let bound = bound_value(limit)?;
    if action.trade_value > bound {
        return Ok(Some(LimitViolation {
            limit_id: limit.id,
            limit_type: limit.limit_type,
            message: format!(
                "single trade limit of {} exceeded (attempted {})",
                bound, action.trade_value
            ),
            limit_value: Some(bound),
            limit_count: None,
            attempted_value: Some(action.trade_value),
            current_usage: None,
            breach_amount: Some(action.trade_value - bound),
        }));
    }
    Ok(None)
}

fn check_daily_order_count(limit: &TradingLimit) -> Result<Option<LimitViolation>, ServiceError> {
    let bound = bound_count(limit)?;
    let projected = limit.usage_count + 1;
    if projected > bound {
        return Ok(Some(LimitViolation {
            limit_id: limit.id,
            limit_type: limit.limit_type,
            message: format!(
                "daily order limit of {} orders would be exceeded (current {})",
                bound, limit.usage_count
            ),
            limit_value: None,
            limit_count: Some(bound),
            attempted_value: None,
            current_usage: Some(Decimal::from(limit.usage_count)),
            breach_amount: None,
        }));
    }
    Ok(None)
}

fn check_allowed_instruments(limit: &TradingLimit, action: &TradingAction) -> Option<LimitViolation> {
    if limit.allows_instrument(&action.instrument) {
        return None;
    }
    let list = limit.limit_text.as_deref().unwrap_or("none");
    Some(LimitViolation {
        limit_id: limit.id,
        limit_type: limit.limit_type,
        message: format!(
            "instrument {} is not in the allowed list: {}",
            action.instrument, list
        ),
        limit_value: None,
        limit_count: None,
        attempted_value: None,
        current_usage: None,
        breach_amount: None,
    })
}

fn check_blocked_instruments(limit: &TradingLimit, action: &TradingAction) -> Option<LimitViolation> {
    if limit.allows_instrument(&action.instrument) {
        return None;
    }
    let list = limit.limit_text.as_deref().unwrap_or("none");
    Some(LimitViolation {
        limit_id: limit.id,
        limit_type: limit.limit_type,
        message: format!(
            "instrument {} is in the blocked list: {}",
            action.instrument, list
        ),
        limit_value: None,
        limit_count: None,
        attempted_value: None,
        current_usage: None,
        breach_amount: None,
    })
}

fn check_trading_hours(limit: &TradingLimit, action: &TradingAction) -> Option<LimitViolation> {
    if limit.allows_time(action.at) {
        return None;
    }
    let window = match (limit.start_time, limit.end_time) {
        (Some(start), Some(end)) => format!("{}-{}", start.format("%H:%M"), end.format("%H:%M")),
        _ => "any time".to_string(),
    };
    let days = limit.allowed_days.as_deref().unwrap_or("all days");
    Some(LimitViolation {
        limit_id: limit.id,
        limit_type: limit.limit_type,
        message: format!(
            "trading not allowed at {} (allowed {} on {})",
            action.at.format("%H:%M:%S on %A"),
            window,
            days
        ),
        limit_value: None,
        limit_count: None,
        attempted_value: None,
        current_usage: None,
        breach_amount: None,
    })
}

fn check_single_order_quantity(
    limit: &TradingLimit,
    action: &TradingAction,
) -> Result<Option<LimitViolation>, ServiceError> {
    let bound = bound_count(limit)?;
    if action.quantity > bound {
        return Ok(Some(LimitViolation {
            limit_id: limit.id,
            limit_type: limit.limit_type,
            message: format!(
                "single order quantity limit of {} exceeded (attempted {})",
                bound, action.quantity
            ),
            limit_value: None,
            limit_count: Some(bound),
            attempted_value: Some(Decimal::from(action.quantity)),
            current_usage: None,
            breach_amount: Some(Decimal::from(action.quantity - bound)),
        }));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone, Utc};

    use crate::health::HealthRegistry;
    use crate::limits::store::InMemoryLimitStore;
    use crate::limits::{BreachAction, ResetFrequency};

    fn scope() -> AccountScope {
        AccountScope {
            user_id: 10,
            account_id: 20,
            org_id: 30,
        }
    }

    fn setup() -> (
        TradingLimitValidator,
        Arc<InMemoryLimitStore>,
        Arc<MetricsRegistry>,
    ) {
        let store = Arc::new(InMemoryLimitStore::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let validator = TradingLimitValidator::new(store.clone(), metrics.clone());
        (validator, store, metrics)
    }

    fn order(value: Decimal) -> TradingAction {
        TradingAction::new(ActionKind::PlaceOrder, "RELIANCE", 10, dec!(2500))
            .with_trade_value(value)
    }

    struct StaticPositions(u64);

    #[async_trait]
    impl PositionsProvider for StaticPositions {
        async fn open_positions(&self, _user: u64, _account: u64) -> Result<u64, ServiceError> {
            Ok(self.0)
        }
    }

    struct FailingPositions;

    #[async_trait]
    impl PositionsProvider for FailingPositions {
        async fn open_positions(&self, _user: u64, _account: u64) -> Result<u64, ServiceError> {
            Err(ServiceError::network("positions service unreachable"))
        }
    }

    #[tokio::test]
    async fn test_no_limits_allows_everything() {
        let (validator, _store, _metrics) = setup();
        let result = validator.validate(scope(), &order(dec!(1000000))).await;
        assert!(result.allowed);
        assert!(result.violations.is_empty());
        assert!(result.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_daily_trading_limit_breach() {
        let (validator, store, _metrics) = setup();
        store.insert_limit(
            TradingLimit::new(1, 10, 20, 30, LimitType::DailyTradingLimit)
                .with_value(dec!(100000))
                .with_usage(dec!(80000), 0),
        );

        let result = validator.validate(scope(), &order(dec!(30000))).await;

        assert!(!result.allowed);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].breach_amount, Some(dec!(10000)));
        assert_eq!(result.breaches.len(), 1);
        // 10% over the limit: medium severity, warn plus admin notice.
        assert_eq!(result.breaches[0].severity, BreachSeverity::Medium);
        assert_eq!(
            result.required_actions,
            vec![BreachAction::Warning, BreachAction::NotifyAdmin]
        );
        assert!(result
            .message
            .as_deref()
            .unwrap()
            .contains("daily trading limit"));

        let stored = store.limit(1).unwrap();
        assert_eq!(stored.usage_value, dec!(80000));
        assert_eq!(stored.breach_count, 1);
        assert_eq!(stored.consecutive_breaches, 1);
        assert!(stored.last_breach_at.is_some());
        assert_eq!(store.breaches().len(), 1);
    }

    #[tokio::test]
    async fn test_soft_limit_warns_but_allows() {
        let (validator, store, _metrics) = setup();
        store.insert_limit(
            TradingLimit::new(1, 10, 20, 30, LimitType::SingleTradeLimit)
                .with_value(dec!(50000))
                .with_enforcement(LimitEnforcement::Soft),
        );

        let result = validator.validate(scope(), &order(dec!(60000))).await;
        assert!(result.allowed);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.breaches.is_empty());
        assert!(store.breaches().is_empty());
    }

    #[tokio::test]
    async fn test_advisory_limit_only_logs() {
        let (validator, store, _metrics) = setup();
        store.insert_limit(
            TradingLimit::new(1, 10, 20, 30, LimitType::SingleTradeLimit)
                .with_value(dec!(50000))
                .with_enforcement(LimitEnforcement::Advisory),
        );

        let result = validator.validate(scope(), &order(dec!(60000))).await;
        assert!(result.allowed);
        assert!(result.warnings.is_empty());
        assert!(result.violations.is_empty());
    }

    #[tokio::test]
    async fn test_single_trade_limit_severity_from_overage() {
        let (validator, store, _metrics) = setup();
        store.insert_limit(
            TradingLimit::new(1, 10, 20, 30, LimitType::SingleTradeLimit).with_value(dec!(50000)),
        );

        // 60% over the limit.
        let result = validator.validate(scope(), &order(dec!(80000))).await;
        assert!(!result.allowed);
        assert_eq!(result.breaches[0].severity, BreachSeverity::Critical);
        assert!(result
            .required_actions
            .contains(&BreachAction::AutoSquareOff));
    }

    #[tokio::test]
    async fn test_daily_order_count() {
        let (validator, store, _metrics) = setup();
        store.insert_limit(
            TradingLimit::new(1, 10, 20, 30, LimitType::DailyOrderCount)
                .with_count(5)
                .with_usage(Decimal::ZERO, 5),
        );

        let result = validator.validate(scope(), &order(dec!(100))).await;
        assert!(!result.allowed);
        assert!(result
            .message
            .as_deref()
            .unwrap()
            .contains("daily order limit"));
        // Count violations carry no monetary overage: first breach is low.
        assert_eq!(result.breaches[0].severity, BreachSeverity::Low);
        assert_eq!(result.required_actions, vec![BreachAction::Warning]);
    }

    #[tokio::test]
    async fn test_consecutive_breaches_escalate() {
        let (validator, store, _metrics) = setup();
        store.insert_limit(
            TradingLimit::new(1, 10, 20, 30, LimitType::DailyOrderCount)
                .with_count(5)
                .with_usage(Decimal::ZERO, 5),
        );

        for _ in 0..6 {
            let result = validator.validate(scope(), &order(dec!(100))).await;
            assert!(!result.allowed);
        }

        let severities: Vec<BreachSeverity> =
            store.breaches().iter().map(|b| b.severity).collect();
        assert_eq!(
            severities,
            vec![
                BreachSeverity::Low,
                BreachSeverity::Medium,
                BreachSeverity::Medium,
                BreachSeverity::High,
                BreachSeverity::High,
                BreachSeverity::Critical,
            ]
        );
        assert_eq!(store.limit(1).unwrap().consecutive_breaches, 6);
    }

    #[tokio::test]
    async fn test_allowed_and_blocked_instruments() {
        let (validator, store, _metrics) = setup();
        store.insert_limit(
            TradingLimit::new(1, 10, 20, 30, LimitType::AllowedInstruments)
                .with_text("RELIANCE,TCS"),
        );
        store.insert_limit(
            TradingLimit::new(2, 10, 20, 30, LimitType::BlockedInstruments).with_text("INFY"),
        );

        let allowed = validator
            .validate(
                scope(),
                &TradingAction::new(ActionKind::PlaceOrder, "TCS", 1, dec!(100)),
            )
            .await;
        assert!(allowed.allowed);

        let outside = validator
            .validate(
                scope(),
                &TradingAction::new(ActionKind::PlaceOrder, "HDFC", 1, dec!(100)),
            )
            .await;
        assert!(!outside.allowed);
        assert!(outside
            .message
            .as_deref()
            .unwrap()
            .contains("not in the allowed list"));

        let blocked = validator
            .validate(
                scope(),
                &TradingAction::new(ActionKind::PlaceOrder, "INFY", 1, dec!(100)),
            )
            .await;
        assert!(!blocked.allowed);
        assert!(blocked
            .message
            .as_deref()
            .unwrap()
            .contains("is in the blocked list"));
    }

    #[tokio::test]
    async fn test_trading_hours() {
        let (validator, store, _metrics) = setup();
        store.insert_limit(
            TradingLimit::new(1, 10, 20, 30, LimitType::TradingHours)
                .with_trading_window(
                    NaiveTime::from_hms_opt(9, 15, 0).unwrap(),
                    NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
                )
                .with_allowed_days("MONDAY,TUESDAY,WEDNESDAY,THURSDAY,FRIDAY"),
        );

        // Monday mid-session.
        let open = order(dec!(100))
            .with_timestamp(Utc.with_ymd_and_hms(2024, 1, 8, 11, 0, 0).unwrap());
        assert!(validator.validate(scope(), &open).await.allowed);

        // Monday after close.
        let late = order(dec!(100))
            .with_timestamp(Utc.with_ymd_and_hms(2024, 1, 8, 16, 0, 0).unwrap());
        let result = validator.validate(scope(), &late).await;
        assert!(!result.allowed);
        assert!(result
            .message
            .as_deref()
            .unwrap()
            .contains("trading not allowed"));

        // Saturday mid-session hours.
        let weekend = order(dec!(100))
            .with_timestamp(Utc.with_ymd_and_hms(2024, 1, 6, 11, 0, 0).unwrap());
        assert!(!validator.validate(scope(), &weekend).await.allowed);
    }

    #[tokio::test]
    async fn test_single_order_quantity() {
        let (validator, store, _metrics) = setup();
        store.insert_limit(
            TradingLimit::new(1, 10, 20, 30, LimitType::SingleOrderQuantity).with_count(100),
        );

        let oversized = TradingAction::new(ActionKind::PlaceOrder, "RELIANCE", 150, dec!(10));
        let result = validator.validate(scope(), &oversized).await;
        assert!(!result.allowed);
        assert_eq!(result.violations[0].breach_amount, Some(dec!(50)));
        // No limit_value on the violation, so overage stays out of severity.
        assert_eq!(result.breaches[0].severity, BreachSeverity::Low);
    }

    #[tokio::test]
    async fn test_max_open_positions_with_provider() {
        let (validator, store, _metrics) = setup();
        let validator = validator.with_positions_provider(Arc::new(StaticPositions(10)));
        store.insert_limit(
            TradingLimit::new(1, 10, 20, 30, LimitType::MaxOpenPositions).with_count(10),
        );

        let result = validator.validate(scope(), &order(dec!(100))).await;
        assert!(!result.allowed);
        assert!(result
            .message
            .as_deref()
            .unwrap()
            .contains("maximum open positions"));

        // Modifications do not open new positions.
        let modify = TradingAction::new(ActionKind::ModifyOrder, "RELIANCE", 10, dec!(100));
        assert!(validator.validate(scope(), &modify).await.allowed);
    }

    #[tokio::test]
    async fn test_max_open_positions_without_provider_skips() {
        let (validator, store, _metrics) = setup();
        store.insert_limit(
            TradingLimit::new(1, 10, 20, 30, LimitType::MaxOpenPositions).with_count(0),
        );
        assert!(validator.validate(scope(), &order(dec!(100))).await.allowed);
    }

    #[tokio::test]
    async fn test_positions_provider_failure_fails_closed() {
        let (validator, store, _metrics) = setup();
        let validator = validator.with_positions_provider(Arc::new(FailingPositions));
        store.insert_limit(
            TradingLimit::new(1, 10, 20, 30, LimitType::MaxOpenPositions).with_count(10),
        );

        let result = validator.validate(scope(), &order(dec!(100))).await;
        assert!(!result.allowed);
        assert!(result
            .message
            .as_deref()
            .unwrap()
            .contains("limit validation failed"));
    }

    #[tokio::test]
    async fn test_daily_auto_reset_zeroes_usage() {
        let (validator, store, _metrics) = setup();
        store.insert_limit(
            TradingLimit::new(1, 10, 20, 30, LimitType::DailyTradingLimit)
                .with_value(dec!(100000))
                .with_usage(dec!(80000), 0)
                .with_last_reset(Utc.with_ymd_and_hms(2024, 1, 7, 9, 0, 0).unwrap()),
        );

        // First validation after midnight sees a clean slate.
        let next_day = order(dec!(30000))
            .with_timestamp(Utc.with_ymd_and_hms(2024, 1, 8, 9, 30, 0).unwrap());
        let result = validator.validate(scope(), &next_day).await;
        assert!(result.allowed);

        let stored = store.limit(1).unwrap();
        assert_eq!(stored.usage_value, Decimal::ZERO);
        assert_eq!(
            stored.last_reset_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 8, 9, 30, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_weekly_reset_frequency() {
        let (validator, store, _metrics) = setup();
        store.insert_limit(
            TradingLimit::new(1, 10, 20, 30, LimitType::DailyTradingLimit)
                .with_value(dec!(100000))
                .with_usage(dec!(90000), 0)
                .with_reset_frequency(ResetFrequency::Weekly)
                .with_last_reset(Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()),
        );

        // Six days in: usage still stands, trade denied.
        let mid_week = order(dec!(30000))
            .with_timestamp(Utc.with_ymd_and_hms(2024, 1, 7, 9, 0, 0).unwrap());
        assert!(!validator.validate(scope(), &mid_week).await.allowed);

        // Seven days in: usage resets, trade clears.
        let next_week = order(dec!(30000))
            .with_timestamp(Utc.with_ymd_and_hms(2024, 1, 8, 9, 0, 0).unwrap());
        assert!(validator.validate(scope(), &next_week).await.allowed);
    }

    #[tokio::test]
    async fn test_hard_violation_leaves_other_limits_untouched() {
        let (validator, store, _metrics) = setup();
        store.insert_limit(
            TradingLimit::new(1, 10, 20, 30, LimitType::SingleTradeLimit).with_value(dec!(50000)),
        );
        store.insert_limit(
            TradingLimit::new(2, 10, 20, 30, LimitType::DailyOrderCount)
                .with_count(100)
                .with_usage(Decimal::ZERO, 40),
        );

        let result = validator.validate(scope(), &order(dec!(60000))).await;
        assert!(!result.allowed);
        assert_eq!(result.violations.len(), 1);

        let untouched = store.limit(2).unwrap();
        assert_eq!(untouched.usage_count, 40);
        assert_eq!(untouched.breach_count, 0);
    }

    #[tokio::test]
    async fn test_warning_threshold_crossing() {
        let (validator, store, _metrics) = setup();
        store.insert_limit(
            TradingLimit::new(1, 10, 20, 30, LimitType::DailyTradingLimit)
                .with_value(dec!(100000))
                .with_usage(dec!(85000), 0),
        );

        let result = validator.validate(scope(), &order(dec!(10000))).await;
        assert!(result.allowed);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].message.contains("approaching"));
    }

    #[tokio::test]
    async fn test_strategy_scoped_limits() {
        let (validator, store, _metrics) = setup();
        store.insert_limit(
            TradingLimit::new(1, 10, 20, 30, LimitType::SingleTradeLimit)
                .with_value(dec!(10000))
                .with_strategy(7),
        );

        // Without a strategy the scoped limit does not apply.
        assert!(validator.validate(scope(), &order(dec!(50000))).await.allowed);

        // With the matching strategy it does.
        let scoped = order(dec!(50000)).with_strategy(7);
        assert!(!validator.validate(scope(), &scoped).await.allowed);
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed() {
        let (validator, store, _metrics) = setup();
        store.set_failing(true);
        let result = validator.validate(scope(), &order(dec!(100))).await;
        assert!(!result.allowed);
        assert!(result
            .message
            .as_deref()
            .unwrap()
            .contains("limit validation failed"));
    }

    #[tokio::test]
    async fn test_update_usage_after_trade() {
        let (validator, store, _metrics) = setup();
        let mut daily = TradingLimit::new(1, 10, 20, 30, LimitType::DailyTradingLimit)
            .with_value(dec!(100000));
        daily.consecutive_breaches = 2;
        store.insert_limit(daily);
        store.insert_limit(
            TradingLimit::new(2, 10, 20, 30, LimitType::MonthlyTradingLimit)
                .with_value(dec!(1000000))
                .with_reset_frequency(ResetFrequency::Monthly),
        );
        store.insert_limit(
            TradingLimit::new(3, 10, 20, 30, LimitType::DailyOrderCount).with_count(100),
        );

        validator
            .update_usage_after_trade(scope(), &order(dec!(30000)))
            .await
            .unwrap();

        assert_eq!(store.limit(1).unwrap().usage_value, dec!(30000));
        assert_eq!(store.limit(1).unwrap().consecutive_breaches, 0);
        assert_eq!(store.limit(2).unwrap().usage_value, dec!(30000));
        assert_eq!(store.limit(3).unwrap().usage_count, 1);
    }

    #[tokio::test]
    async fn test_hard_breach_emits_alert() {
        let store = Arc::new(InMemoryLimitStore::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let health = Arc::new(HealthRegistry::new());
        let engine = Arc::new(AlertEngine::new("test-service", metrics.clone(), health));
        let validator = TradingLimitValidator::new(store.clone(), metrics)
            .with_alert_engine(engine.clone());

        store.insert_limit(
            TradingLimit::new(1, 10, 20, 30, LimitType::DailyTradingLimit)
                .with_value(dec!(100000))
                .with_usage(dec!(80000), 0),
        );

        let result = validator.validate(scope(), &order(dec!(30000))).await;
        assert!(!result.allowed);

        let alerts = engine.active_alerts();
        assert_eq!(alerts.len(), 1);
        // 10% over maps to the warning tier.
        assert_eq!(alerts[0].severity, AlertSeverity::Medium);
        assert!(alerts[0]
            .rule_name
            .starts_with("trading_limit_breach_daily_trading_limit"));
        assert_eq!(
            alerts[0].labels.get("limit_type").map(String::as_str),
            Some("daily_trading_limit")
        );
    }

    #[tokio::test]
    async fn test_breach_alert_suppressed_when_opted_out() {
        let store = Arc::new(InMemoryLimitStore::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let health = Arc::new(HealthRegistry::new());
        let engine = Arc::new(AlertEngine::new("test-service", metrics.clone(), health));
        let validator = TradingLimitValidator::new(store.clone(), metrics)
            .with_alert_engine(engine.clone());

        let mut limit = TradingLimit::new(1, 10, 20, 30, LimitType::SingleTradeLimit)
            .with_value(dec!(50000));
        limit.notify_on_breach = false;
        store.insert_limit(limit);

        let result = validator.validate(scope(), &order(dec!(60000))).await;
        assert!(!result.allowed);
        assert_eq!(store.breaches().len(), 1);
        assert!(engine.active_alerts().is_empty());
    }

    #[tokio::test]
    async fn test_override_possible_flag() {
        let (validator, store, _metrics) = setup();
        store.insert_limit(
            TradingLimit::new(1, 10, 20, 30, LimitType::SingleTradeLimit)
                .with_value(dec!(50000))
                .with_override_allowed(true),
        );

        let result = validator.validate(scope(), &order(dec!(60000))).await;
        assert!(!result.allowed);
        assert!(result.override_possible);
    }
}
