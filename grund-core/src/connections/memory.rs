//! In-memory backends.
//!
//! [`InMemoryKv`] is both the fallback store handed out when the real
//! key-value backend is unavailable and the workhorse for tests. The
//! other stores here are test doubles with the same failure-injection
//! hooks. None of them persist anything.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use super::backends::{
    BackendResult, DocumentStore, KvStore, MessageBroker, PoolStatus, RelationalStore,
    ScoredMember,
};
use crate::errors::ServiceError;

const BUCKET_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: f64,
}

#[derive(Default)]
struct KvInner {
    strings: HashMap<String, String>,
    zsets: HashMap<String, Vec<(f64, String)>>,
    buckets: HashMap<String, Bucket>,
    expiry: HashMap<String, Instant>,
}

impl KvInner {
    /// Lazy expiry, applied on access like the real store would.
    fn purge(&mut self, key: &str) {
        if let Some(deadline) = self.expiry.get(key) {
            if Instant::now() >= *deadline {
                self.expiry.remove(key);
                self.strings.remove(key);
                self.zsets.remove(key);
                self.buckets.remove(key);
            }
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        self.expiry.remove(key);
        let s = self.strings.remove(key).is_some();
        let z = self.zsets.remove(key).is_some();
        let b = self.buckets.remove(key).is_some();
        s || z || b
    }

    fn contains(&self, key: &str) -> bool {
        self.strings.contains_key(key)
            || self.zsets.contains_key(key)
            || self.buckets.contains_key(key)
    }
}

/// Process-local key-value store with TTLs, ordered sets, and the
/// compound operations. Data does not survive the process.
pub struct InMemoryKv {
    inner: Mutex<KvInner>,
    failing: AtomicBool,
    ping_delay: Mutex<Option<Duration>>,
    memory_pressure: Mutex<Option<f64>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        info!("in-memory key-value store created, data will not persist");
        Self {
            inner: Mutex::new(KvInner::default()),
            failing: AtomicBool::new(false),
            ping_delay: Mutex::new(None),
            memory_pressure: Mutex::new(None),
        }
    }

    /// Make every operation fail until cleared. Test hook.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay pings by this much. Test hook for latency thresholds.
    pub fn set_ping_delay(&self, delay: Option<Duration>) {
        *self.ping_delay.lock() = delay;
    }

    /// Report a fixed memory pressure. Test hook.
    pub fn set_memory_pressure(&self, pressure: Option<f64>) {
        *self.memory_pressure.lock() = pressure;
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.strings.len() + inner.zsets.len() + inner.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> BackendResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ServiceError::database("in-memory key-value store failing"));
        }
        Ok(())
    }
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        self.check()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        Ok(inner.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> BackendResult<()> {
        self.check()?;
        let mut inner = self.inner.lock();
        inner.expiry.remove(key);
        inner.strings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn setex(&self, key: &str, ttl: Duration, value: &str) -> BackendResult<()> {
        self.check()?;
        let mut inner = self.inner.lock();
        inner.strings.insert(key.to_string(), value.to_string());
        inner.expiry.insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> BackendResult<bool> {
        self.check()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        Ok(inner.remove(key))
    }

    async fn exists(&self, key: &str) -> BackendResult<bool> {
        self.check()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        Ok(inner.contains(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> BackendResult<bool> {
        self.check()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        if !inner.contains(key) {
            return Ok(false);
        }
        inner.expiry.insert(key.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn incr(&self, key: &str) -> BackendResult<i64> {
        self.check()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        let current: i64 = match inner.strings.get(key) {
            Some(raw) => raw.parse().map_err(|_| {
                ServiceError::validation(format!("key '{}' holds a non-integer value", key))
            })?,
            None => 0,
        };
        let next = current + 1;
        inner.strings.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    async fn ping(&self) -> BackendResult<()> {
        let delay = *self.ping_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check()
    }

    async fn close(&self) -> BackendResult<()> {
        debug!("in-memory key-value store closed");
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> BackendResult<bool> {
        self.check()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        let set = inner.zsets.entry(key.to_string()).or_default();
        let existed = set.iter().position(|(_, m)| m == member);
        if let Some(idx) = existed {
            set.remove(idx);
        }
        set.push((score, member.to_string()));
        set.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });
        Ok(existed.is_none())
    }

    async fn zcard(&self, key: &str) -> BackendResult<u64> {
        self.check()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        Ok(inner.zsets.get(key).map_or(0, |set| set.len() as u64))
    }

    async fn zrem(&self, key: &str, member: &str) -> BackendResult<bool> {
        self.check()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        let Some(set) = inner.zsets.get_mut(key) else {
            return Ok(false);
        };
        match set.iter().position(|(_, m)| m == member) {
            Some(idx) => {
                set.remove(idx);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> BackendResult<u64> {
        self.check()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        let Some(set) = inner.zsets.get_mut(key) else {
            return Ok(0);
        };
        let before = set.len();
        set.retain(|(score, _)| *score < min || *score > max);
        Ok((before - set.len()) as u64)
    }

    async fn zrange_withscores(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> BackendResult<Vec<ScoredMember>> {
        self.check()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        let Some(set) = inner.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let len = set.len() as i64;
        let lo = if start < 0 { len + start } else { start }.max(0);
        let hi = if stop < 0 { len + stop } else { stop }.min(len - 1);
        if lo > hi || lo >= len {
            return Ok(Vec::new());
        }
        Ok(set[lo as usize..=hi as usize]
            .iter()
            .map(|(score, member)| ScoredMember {
                member: member.clone(),
                score: *score,
            })
            .collect())
    }

    async fn incr_with_expire(&self, key: &str, ttl: Duration) -> BackendResult<i64> {
        let next = self.incr(key).await?;
        self.expire(key, ttl).await?;
        Ok(next)
    }

    async fn token_bucket_take(
        &self,
        key: &str,
        capacity: f64,
        refill_rate: f64,
        now: f64,
    ) -> BackendResult<(bool, f64)> {
        self.check()?;
        let mut inner = self.inner.lock();
        inner.purge(key);
        let bucket = inner.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: capacity,
            last_refill: now,
        });
        let elapsed = (now - bucket.last_refill).max(0.0);
        bucket.tokens = (bucket.tokens + elapsed * refill_rate).min(capacity);
        bucket.last_refill = now;
        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }
        let remaining = bucket.tokens;
        inner.expiry.insert(key.to_string(), Instant::now() + BUCKET_TTL);
        Ok((allowed, remaining))
    }

    async fn memory_pressure(&self) -> BackendResult<Option<f64>> {
        self.check()?;
        Ok(*self.memory_pressure.lock())
    }
}

/// Relational test double. Records statements and serves canned rows.
pub struct InMemoryRelational {
    executed: Mutex<Vec<String>>,
    canned_rows: Mutex<Vec<Value>>,
    pool: Mutex<Option<PoolStatus>>,
    failing: AtomicBool,
    fail_next_pings: AtomicU32,
    ping_delay: Mutex<Option<Duration>>,
}

impl InMemoryRelational {
    pub fn new() -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
            canned_rows: Mutex::new(Vec::new()),
            pool: Mutex::new(None),
            failing: AtomicBool::new(false),
            fail_next_pings: AtomicU32::new(0),
            ping_delay: Mutex::new(None),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail the next `count` pings, then recover. Models a backend that
    /// is briefly unreachable during startup.
    pub fn fail_next_pings(&self, count: u32) {
        self.fail_next_pings.store(count, Ordering::SeqCst);
    }

    pub fn set_ping_delay(&self, delay: Option<Duration>) {
        *self.ping_delay.lock() = delay;
    }

    pub fn set_canned_rows(&self, rows: Vec<Value>) {
        *self.canned_rows.lock() = rows;
    }

    pub fn set_pool_status(&self, status: Option<PoolStatus>) {
        *self.pool.lock() = status;
    }

    pub fn executed_statements(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    fn check(&self) -> BackendResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ServiceError::database("in-memory relational store failing"));
        }
        Ok(())
    }
}

impl Default for InMemoryRelational {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelationalStore for InMemoryRelational {
    async fn execute(&self, statement: &str) -> BackendResult<u64> {
        self.check()?;
        self.executed.lock().push(statement.to_string());
        Ok(0)
    }

    async fn query(&self, statement: &str) -> BackendResult<Vec<Value>> {
        self.check()?;
        self.executed.lock().push(statement.to_string());
        Ok(self.canned_rows.lock().clone())
    }

    async fn ping(&self) -> BackendResult<()> {
        let delay = *self.ping_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_next_pings.load(Ordering::SeqCst) > 0 {
            self.fail_next_pings.fetch_sub(1, Ordering::SeqCst);
            return Err(ServiceError::database(
                "in-memory relational store failing",
            ));
        }
        self.check()
    }

    async fn close(&self) -> BackendResult<()> {
        debug!("in-memory relational store closed");
        Ok(())
    }

    fn pool_status(&self) -> Option<PoolStatus> {
        *self.pool.lock()
    }
}

/// Broker test double backed by per-channel queues.
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    next_channel: AtomicU64,
    failing: AtomicBool,
    ping_delay: Mutex<Option<Duration>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            next_channel: AtomicU64::new(1),
            failing: AtomicBool::new(false),
            ping_delay: Mutex::new(None),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_ping_delay(&self, delay: Option<Duration>) {
        *self.ping_delay.lock() = delay;
    }

    pub fn pending(&self, channel: &str) -> usize {
        self.queues.lock().get(channel).map_or(0, VecDeque::len)
    }

    fn check(&self) -> BackendResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ServiceError::network("in-memory broker failing"));
        }
        Ok(())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn channel(&self) -> BackendResult<u64> {
        self.check()?;
        Ok(self.next_channel.fetch_add(1, Ordering::SeqCst))
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> BackendResult<()> {
        self.check()?;
        self.queues
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push_back(payload.to_vec());
        Ok(())
    }

    async fn consume(&self, channel: &str) -> BackendResult<Option<Vec<u8>>> {
        self.check()?;
        Ok(self
            .queues
            .lock()
            .get_mut(channel)
            .and_then(VecDeque::pop_front))
    }

    async fn ping(&self) -> BackendResult<()> {
        let delay = *self.ping_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check()
    }

    async fn close(&self) -> BackendResult<()> {
        self.queues.lock().clear();
        debug!("in-memory broker closed");
        Ok(())
    }
}

/// Document-store test double with exact-field filtering.
pub struct InMemoryDocumentStore {
    collections: Mutex<HashMap<String, Vec<Value>>>,
    failing: AtomicBool,
    ping_delay: Mutex<Option<Duration>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
            ping_delay: Mutex::new(None),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_ping_delay(&self, delay: Option<Duration>) {
        *self.ping_delay.lock() = delay;
    }

    fn check(&self) -> BackendResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ServiceError::database("in-memory document store failing"));
        }
        Ok(())
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_filter(document: &Value, filter: &Value) -> bool {
    match filter.as_object() {
        Some(fields) => fields
            .iter()
            .all(|(key, expected)| document.get(key) == Some(expected)),
        None => true,
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn ping(&self) -> BackendResult<()> {
        let delay = *self.ping_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check()
    }

    async fn find(&self, collection: &str, filter: &Value) -> BackendResult<Vec<Value>> {
        self.check()?;
        Ok(self
            .collections
            .lock()
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|doc| matches_filter(doc, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert(&self, collection: &str, document: &Value) -> BackendResult<()> {
        self.check()?;
        self.collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .push(document.clone());
        Ok(())
    }

    async fn close(&self) -> BackendResult<()> {
        self.collections.lock().clear();
        debug!("in-memory document store closed");
        Ok(())
    }
}
