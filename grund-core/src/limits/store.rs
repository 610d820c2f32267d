//! Limit persistence seam.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::{LimitBreach, TradingLimit};
use crate::errors::ServiceError;

/// Storage behind the validator. Services back this with their
/// relational schema; tests use [`InMemoryLimitStore`].
#[async_trait]
pub trait LimitStore: Send + Sync {
    /// Active limits for the user within the account. With a strategy,
    /// returns strategy-scoped rows for that strategy plus
    /// account-wide rows; without one, account-wide rows only.
    async fn active_limits(
        &self,
        user_id: u64,
        account_id: u64,
        strategy_id: Option<u64>,
    ) -> Result<Vec<TradingLimit>, ServiceError>;

    /// Persist an updated limit row (usage counters, breach
    /// bookkeeping, reset timestamps).
    async fn save_limit(&self, limit: &TradingLimit) -> Result<(), ServiceError>;

    /// Persist a breach record, returning its assigned id.
    async fn record_breach(&self, breach: &LimitBreach) -> Result<u64, ServiceError>;
}

/// Process-local limit store for tests and development.
pub struct InMemoryLimitStore {
    limits: RwLock<HashMap<u64, TradingLimit>>,
    breaches: Mutex<Vec<LimitBreach>>,
    next_breach_id: AtomicU64,
    failing: AtomicBool,
}

impl InMemoryLimitStore {
    pub fn new() -> Self {
        Self {
            limits: RwLock::new(HashMap::new()),
            breaches: Mutex::new(Vec::new()),
            next_breach_id: AtomicU64::new(1),
            failing: AtomicBool::new(false),
        }
    }

    pub fn insert_limit(&self, limit: TradingLimit) {
        self.limits.write().insert(limit.id, limit);
    }

    pub fn limit(&self, id: u64) -> Option<TradingLimit> {
        self.limits.read().get(&id).cloned()
    }

    pub fn breaches(&self) -> Vec<LimitBreach> {
        self.breaches.lock().clone()
    }

    pub fn breaches_for_user(&self, user_id: u64) -> Vec<LimitBreach> {
        self.breaches
            .lock()
            .iter()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Test hook: every store call fails while set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_failing(&self) -> Result<(), ServiceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ServiceError::database("limit store unavailable"));
        }
        Ok(())
    }
}

impl Default for InMemoryLimitStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LimitStore for InMemoryLimitStore {
    async fn active_limits(
        &self,
        user_id: u64,
        account_id: u64,
        strategy_id: Option<u64>,
    ) -> Result<Vec<TradingLimit>, ServiceError> {
        self.check_failing()?;
        let mut rows: Vec<TradingLimit> = self
            .limits
            .read()
            .values()
            .filter(|l| l.user_id == user_id && l.account_id == account_id && l.active)
            .filter(|l| match strategy_id {
                Some(strategy) => l.strategy_id.is_none() || l.strategy_id == Some(strategy),
                None => l.strategy_id.is_none(),
            })
            .cloned()
            .collect();
        rows.sort_by_key(|l| l.id);
        Ok(rows)
    }

    async fn save_limit(&self, limit: &TradingLimit) -> Result<(), ServiceError> {
        self.check_failing()?;
        self.limits.write().insert(limit.id, limit.clone());
        Ok(())
    }

    async fn record_breach(&self, breach: &LimitBreach) -> Result<u64, ServiceError> {
        self.check_failing()?;
        let id = self.next_breach_id.fetch_add(1, Ordering::SeqCst);
        let mut stored = breach.clone();
        stored.id = id;
        debug!(
            breach_id = id,
            breach_type = stored.breach_type.as_str(),
            user_id = stored.user_id,
            "breach recorded"
        );
        self.breaches.lock().push(stored);
        Ok(id)
    }
}
