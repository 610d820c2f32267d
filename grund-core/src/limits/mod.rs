//! Per-user trading limits.
//!
//! A [`TradingLimit`] row scopes one constraint to a user within a
//! trading account, optionally narrowed to a strategy. The
//! [`validator::TradingLimitValidator`] checks actions against the
//! active rows, records breaches, and keeps usage counters current.
//! Storage sits behind the [`store::LimitStore`] trait so services can
//! plug their relational schema in; [`store::InMemoryLimitStore`]
//! covers tests and development.

use std::fmt;

use chrono::{DateTime, Datelike, NaiveTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

pub mod store;
pub mod validator;

pub use store::{InMemoryLimitStore, LimitStore};
pub use validator::{AccountScope, PositionsProvider, TradingLimitValidator};

/// Everything a limit row can constrain. Only a subset has a dedicated
/// validation check; the rest are carried for scoping and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    // Financial
    DailyTradingLimit,
    SingleTradeLimit,
    DailyLossLimit,
    MonthlyTradingLimit,
    PositionValueLimit,
    // Quantity
    DailyOrderCount,
    SingleOrderQuantity,
    MaxOpenPositions,
    // Instrument
    AllowedInstruments,
    BlockedInstruments,
    AllowedSegments,
    // Time
    TradingHours,
    AllowedDays,
    // Leverage
    MaxLeverage,
    MarginUtilization,
    // Strategy
    StrategyAllocation,
    MaxStrategies,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::DailyTradingLimit => "daily_trading_limit",
            LimitType::SingleTradeLimit => "single_trade_limit",
            LimitType::DailyLossLimit => "daily_loss_limit",
            LimitType::MonthlyTradingLimit => "monthly_trading_limit",
            LimitType::PositionValueLimit => "position_value_limit",
            LimitType::DailyOrderCount => "daily_order_count",
            LimitType::SingleOrderQuantity => "single_order_quantity",
            LimitType::MaxOpenPositions => "max_open_positions",
            LimitType::AllowedInstruments => "allowed_instruments",
            LimitType::BlockedInstruments => "blocked_instruments",
            LimitType::AllowedSegments => "allowed_segments",
            LimitType::TradingHours => "trading_hours",
            LimitType::AllowedDays => "allowed_days",
            LimitType::MaxLeverage => "max_leverage",
            LimitType::MarginUtilization => "margin_utilization",
            LimitType::StrategyAllocation => "strategy_allocation",
            LimitType::MaxStrategies => "max_strategies",
        }
    }
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    AccountWide,
    StrategySpecific,
    InstrumentSpecific,
}

/// How strictly a violated limit is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitEnforcement {
    /// Blocks the action.
    Hard,
    /// Allows the action but reports a warning.
    Soft,
    /// Logged only.
    Advisory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetFrequency {
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreachSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl BreachSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreachSeverity::Low => "low",
            BreachSeverity::Medium => "medium",
            BreachSeverity::High => "high",
            BreachSeverity::Critical => "critical",
        }
    }

    /// Severity from how far over the limit the action went and how
    /// many breaches preceded it without a clean trade in between.
    pub fn classify(breach_percentage: Decimal, consecutive_breaches: u32) -> Self {
        if breach_percentage >= dec!(50) || consecutive_breaches >= 5 {
            BreachSeverity::Critical
        } else if breach_percentage >= dec!(25) || consecutive_breaches >= 3 {
            BreachSeverity::High
        } else if breach_percentage >= dec!(10) || consecutive_breaches >= 1 {
            BreachSeverity::Medium
        } else {
            BreachSeverity::Low
        }
    }

    /// Escalation ladder applied when a breach of this severity is
    /// recorded.
    pub fn required_actions(&self) -> Vec<BreachAction> {
        match self {
            BreachSeverity::Low => vec![BreachAction::Warning],
            BreachSeverity::Medium => vec![BreachAction::Warning, BreachAction::NotifyAdmin],
            BreachSeverity::High => vec![
                BreachAction::Warning,
                BreachAction::Restrict,
                BreachAction::NotifyAdmin,
            ],
            BreachSeverity::Critical => vec![
                BreachAction::Warning,
                BreachAction::Suspend,
                BreachAction::NotifyAdmin,
                BreachAction::AutoSquareOff,
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreachAction {
    Warning,
    Restrict,
    Suspend,
    NotifyAdmin,
    AutoSquareOff,
}

impl BreachAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreachAction::Warning => "warning",
            BreachAction::Restrict => "restrict",
            BreachAction::Suspend => "suspend",
            BreachAction::NotifyAdmin => "notify_admin",
            BreachAction::AutoSquareOff => "auto_square_off",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreachStatus {
    Detected,
    Notified,
    Resolved,
    Acknowledged,
    Escalated,
}

/// One limit row. Monetary limits carry `limit_value`, count limits
/// carry `limit_count`, instrument and day restrictions carry
/// `limit_text` as a comma-separated list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingLimit {
    pub id: u64,
    pub user_id: u64,
    pub account_id: u64,
    pub org_id: u64,
    pub strategy_id: Option<u64>,
    pub limit_type: LimitType,
    pub scope: LimitScope,
    pub enforcement: LimitEnforcement,
    pub limit_value: Option<Decimal>,
    pub limit_count: Option<u64>,
    pub limit_text: Option<String>,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub allowed_days: Option<String>,
    pub usage_value: Decimal,
    pub usage_count: u64,
    pub reset_frequency: ResetFrequency,
    pub last_reset_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub override_allowed: bool,
    pub auto_reset: bool,
    pub breach_count: u64,
    pub last_breach_at: Option<DateTime<Utc>>,
    pub consecutive_breaches: u32,
    /// Percentage of the limit at which warnings start.
    pub warning_threshold: Decimal,
    pub notify_on_breach: bool,
}

impl TradingLimit {
    pub fn new(id: u64, user_id: u64, account_id: u64, org_id: u64, limit_type: LimitType) -> Self {
        Self {
            id,
            user_id,
            account_id,
            org_id,
            strategy_id: None,
            limit_type,
            scope: LimitScope::AccountWide,
            enforcement: LimitEnforcement::Hard,
            limit_value: None,
            limit_count: None,
            limit_text: None,
            start_time: None,
            end_time: None,
            allowed_days: None,
            usage_value: Decimal::ZERO,
            usage_count: 0,
            reset_frequency: ResetFrequency::Daily,
            last_reset_at: None,
            active: true,
            override_allowed: false,
            auto_reset: true,
            breach_count: 0,
            last_breach_at: None,
            consecutive_breaches: 0,
            warning_threshold: dec!(80),
            notify_on_breach: true,
        }
    }

    pub fn with_value(mut self, value: Decimal) -> Self {
        self.limit_value = Some(value);
        self
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.limit_count = Some(count);
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.limit_text = Some(text.to_string());
        self
    }

    pub fn with_enforcement(mut self, enforcement: LimitEnforcement) -> Self {
        self.enforcement = enforcement;
        self
    }

    pub fn with_scope(mut self, scope: LimitScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_strategy(mut self, strategy_id: u64) -> Self {
        self.strategy_id = Some(strategy_id);
        self.scope = LimitScope::StrategySpecific;
        self
    }

    pub fn with_trading_window(mut self, start: NaiveTime, end: NaiveTime) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    pub fn with_allowed_days(mut self, days: &str) -> Self {
        self.allowed_days = Some(days.to_string());
        self
    }

    pub fn with_reset_frequency(mut self, frequency: ResetFrequency) -> Self {
        self.reset_frequency = frequency;
        self
    }

    pub fn with_usage(mut self, value: Decimal, count: u64) -> Self {
        self.usage_value = value;
        self.usage_count = count;
        self
    }

    pub fn with_last_reset(mut self, at: DateTime<Utc>) -> Self {
        self.last_reset_at = Some(at);
        self
    }

    pub fn with_warning_threshold(mut self, percentage: Decimal) -> Self {
        self.warning_threshold = percentage;
        self
    }

    pub fn with_override_allowed(mut self, allowed: bool) -> Self {
        self.override_allowed = allowed;
        self
    }

    /// Current usage as a percentage of whichever bound the row
    /// carries. Zero when the row has no numeric bound.
    pub fn usage_percentage(&self) -> Decimal {
        if let Some(value) = self.limit_value {
            if value > Decimal::ZERO {
                return self.usage_value / value * dec!(100);
            }
        }
        if let Some(count) = self.limit_count {
            if count > 0 {
                return Decimal::from(self.usage_count) / Decimal::from(count) * dec!(100);
            }
        }
        Decimal::ZERO
    }

    pub fn is_breached(&self) -> bool {
        if let Some(value) = self.limit_value {
            return self.usage_value > value;
        }
        if let Some(count) = self.limit_count {
            return self.usage_count > count;
        }
        false
    }

    pub fn should_warn(&self) -> bool {
        self.usage_percentage() >= self.warning_threshold
    }

    /// Remaining headroom before the numeric bound is exhausted.
    pub fn remaining_limit(&self) -> Decimal {
        if let Some(value) = self.limit_value {
            return (value - self.usage_value).max(Decimal::ZERO);
        }
        if let Some(count) = self.limit_count {
            return (Decimal::from(count) - Decimal::from(self.usage_count)).max(Decimal::ZERO);
        }
        Decimal::ZERO
    }

    pub fn reset_usage(&mut self, at: DateTime<Utc>) {
        self.usage_value = Decimal::ZERO;
        self.usage_count = 0;
        self.consecutive_breaches = 0;
        self.last_reset_at = Some(at);
    }

    /// Whether `at` falls inside the allowed window and on an allowed
    /// weekday. Rows without a window or day list allow everything.
    pub fn allows_time(&self, at: DateTime<Utc>) -> bool {
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            let time = at.time();
            if time < start || time > end {
                return false;
            }
        }
        if let Some(days) = &self.allowed_days {
            let today = at.format("%A").to_string().to_uppercase();
            let allowed = days
                .split(',')
                .any(|day| day.trim().to_uppercase() == today);
            if !allowed {
                return false;
            }
        }
        true
    }

    /// Instrument admission for allow- and block-list rows. An
    /// allow-list with no entries admits nothing; a block-list with no
    /// entries admits everything. Rows of other types always admit.
    pub fn allows_instrument(&self, instrument: &str) -> bool {
        let wanted = instrument.trim().to_uppercase();
        match self.limit_type {
            LimitType::AllowedInstruments => match &self.limit_text {
                Some(text) => text
                    .split(',')
                    .any(|entry| entry.trim().to_uppercase() == wanted),
                None => false,
            },
            LimitType::BlockedInstruments => match &self.limit_text {
                Some(text) => !text
                    .split(',')
                    .any(|entry| entry.trim().to_uppercase() == wanted),
                None => true,
            },
            _ => true,
        }
    }

    /// Whether the usage-reset period has elapsed since the last reset.
    pub fn reset_due(&self, at: DateTime<Utc>) -> bool {
        if !self.auto_reset {
            return false;
        }
        let last = match self.last_reset_at {
            Some(last) => last,
            None => return false,
        };
        match self.reset_frequency {
            ResetFrequency::Daily => at.date_naive() > last.date_naive(),
            ResetFrequency::Weekly => (at - last).num_days() >= 7,
            ResetFrequency::Monthly => {
                (at.year(), at.month()) > (last.year(), last.month())
            }
        }
    }
}

/// The kind of order operation being validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    PlaceOrder,
    ModifyOrder,
    CancelOrder,
    SquareOff,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::PlaceOrder => "place_order",
            ActionKind::ModifyOrder => "modify_order",
            ActionKind::CancelOrder => "cancel_order",
            ActionKind::SquareOff => "square_off",
        }
    }
}

/// A trading action awaiting approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingAction {
    pub kind: ActionKind,
    pub instrument: String,
    pub quantity: u64,
    pub price: Decimal,
    pub trade_value: Decimal,
    pub order_type: String,
    pub strategy_id: Option<u64>,
    pub at: DateTime<Utc>,
}

impl TradingAction {
    pub fn new(kind: ActionKind, instrument: &str, quantity: u64, price: Decimal) -> Self {
        Self {
            kind,
            instrument: instrument.to_string(),
            quantity,
            price,
            trade_value: price * Decimal::from(quantity),
            order_type: "MARKET".to_string(),
            strategy_id: None,
            at: Utc::now(),
        }
    }

    pub fn with_trade_value(mut self, value: Decimal) -> Self {
        self.trade_value = value;
        self
    }

    pub fn with_order_type(mut self, order_type: &str) -> Self {
        self.order_type = order_type.to_string();
        self
    }

    pub fn with_strategy(mut self, strategy_id: u64) -> Self {
        self.strategy_id = Some(strategy_id);
        self
    }

    pub fn with_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }
}

/// One limit the action ran afoul of, with enough numbers attached to
/// explain the denial to a caller.
#[derive(Debug, Clone, Serialize)]
pub struct LimitViolation {
    pub limit_id: u64,
    pub limit_type: LimitType,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_value: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempted_value: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_usage: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breach_amount: Option<Decimal>,
}

impl LimitViolation {
    /// How far over the limit the action went, relative to the limit.
    /// Violations without monetary figures report zero.
    pub fn breach_percentage(&self) -> Decimal {
        match (self.breach_amount, self.limit_value) {
            (Some(amount), Some(value)) if value > Decimal::ZERO => amount / value * dec!(100),
            _ => Decimal::ZERO,
        }
    }
}

/// Persistent record of a hard-limit breach.
#[derive(Debug, Clone, Serialize)]
pub struct LimitBreach {
    pub id: u64,
    pub user_id: u64,
    pub account_id: u64,
    pub org_id: u64,
    pub limit_id: u64,
    pub breach_type: LimitType,
    pub severity: BreachSeverity,
    pub status: BreachStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_value: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempted_value: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_usage: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breach_amount: Option<Decimal>,
    pub action_attempted: ActionKind,
    pub instrument: String,
    pub reason: String,
    pub actions_taken: Vec<BreachAction>,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl LimitBreach {
    pub fn breach_percentage(&self) -> Decimal {
        match (self.breach_amount, self.limit_value) {
            (Some(amount), Some(value)) if value > Decimal::ZERO => amount / value * dec!(100),
            _ => Decimal::ZERO,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status == BreachStatus::Resolved
    }

    pub fn add_action(&mut self, action: BreachAction) {
        if !self.actions_taken.contains(&action) {
            self.actions_taken.push(action);
        }
    }
}

/// Outcome of validating one action against the applicable limits.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub allowed: bool,
    pub violations: Vec<LimitViolation>,
    pub warnings: Vec<LimitViolation>,
    pub breaches: Vec<LimitBreach>,
    pub required_actions: Vec<BreachAction>,
    pub override_possible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self {
            allowed: true,
            violations: Vec::new(),
            warnings: Vec::new(),
            breaches: Vec::new(),
            required_actions: Vec::new(),
            override_possible: false,
            message: None,
        }
    }
}
