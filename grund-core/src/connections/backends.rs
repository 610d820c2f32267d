//! Client seams for the backing stores.
//!
//! Services plug real drivers in behind these traits; the library only
//! needs the small surface the connection manager, rate limiters, and
//! health checks actually touch. Scores on the ordered-set operations
//! are unix-second timestamps throughout.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::errors::ServiceError;

pub type BackendResult<T> = Result<T, ServiceError>;

/// Pool utilization snapshot for stores that run a connection pool.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStatus {
    pub size: u32,
    pub in_use: u32,
}

impl PoolStatus {
    pub fn utilization(&self) -> f64 {
        if self.size == 0 {
            return 0.0;
        }
        self.in_use as f64 / self.size as f64
    }
}

/// Ordered-set member with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

/// Relational store (time-series SQL databases included).
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Run a statement, returning the affected row count.
    async fn execute(&self, statement: &str) -> BackendResult<u64>;

    /// Run a query, returning rows as JSON objects.
    async fn query(&self, statement: &str) -> BackendResult<Vec<Value>>;

    async fn ping(&self) -> BackendResult<()>;

    async fn close(&self) -> BackendResult<()>;

    fn pool_status(&self) -> Option<PoolStatus> {
        None
    }
}

/// Key-value store with TTLs and ordered sets.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> BackendResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> BackendResult<()>;

    /// Set with a time-to-live.
    async fn setex(&self, key: &str, ttl: Duration, value: &str) -> BackendResult<()>;

    /// Returns true when the key existed.
    async fn delete(&self, key: &str) -> BackendResult<bool>;

    async fn exists(&self, key: &str) -> BackendResult<bool>;

    /// Attach a TTL to an existing key; false when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> BackendResult<bool>;

    /// Increment an integer value, creating it at 0 first.
    async fn incr(&self, key: &str) -> BackendResult<i64>;

    async fn ping(&self) -> BackendResult<()>;

    async fn close(&self) -> BackendResult<()>;

    /// Add a member; replaces the score when the member exists. Returns
    /// true for a newly added member.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> BackendResult<bool>;

    async fn zcard(&self, key: &str) -> BackendResult<u64>;

    async fn zrem(&self, key: &str, member: &str) -> BackendResult<bool>;

    /// Remove members with `min <= score <= max`, returning the count.
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> BackendResult<u64>;

    /// Members by rank, ascending by score. Negative indices count from
    /// the end, both bounds inclusive.
    async fn zrange_withscores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> BackendResult<Vec<ScoredMember>>;

    /// INCR plus EXPIRE in one round trip; script-capable stores run this
    /// atomically server-side.
    async fn incr_with_expire(&self, key: &str, ttl: Duration) -> BackendResult<i64>;

    /// Atomic token-bucket take of a single token. The bucket starts
    /// full; elapsed time refills at `refill_rate` tokens/second up to
    /// `capacity`. Returns (allowed, tokens remaining).
    async fn token_bucket_take(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        now: f64,
    ) -> BackendResult<(bool, f64)>;

    /// Memory pressure in [0, 1] when the store reports usage.
    async fn memory_pressure(&self) -> BackendResult<Option<f64>> {
        Ok(None)
    }
}

/// Message broker.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Open a logical channel, returning its id.
    async fn channel(&self) -> BackendResult<u64>;

    async fn publish(&self, channel: &str, payload: &[u8]) -> BackendResult<()>;

    /// Pop the next pending message on a channel, if any.
    async fn consume(&self, channel: &str) -> BackendResult<Option<Vec<u8>>>;

    async fn ping(&self) -> BackendResult<()>;

    async fn close(&self) -> BackendResult<()>;
}

/// Document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn ping(&self) -> BackendResult<()>;

    /// Find documents where every filter field matches exactly.
    async fn find(&self, collection: &str, filter: &Value) -> BackendResult<Vec<Value>>;

    async fn insert(&self, collection: &str, document: &Value) -> BackendResult<()>;

    async fn close(&self) -> BackendResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_utilization() {
        let pool = PoolStatus { size: 10, in_use: 9 };
        assert!((pool.utilization() - 0.9).abs() < f64::EPSILON);
        let empty = PoolStatus { size: 0, in_use: 0 };
        assert_eq!(empty.utilization(), 0.0);
    }
}
