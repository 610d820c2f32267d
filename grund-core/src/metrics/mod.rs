//! In-memory metrics registry.
//!
//! Typed instruments (counter, gauge, histogram, timer) write into bounded
//! per-series point deques keyed by `(name, kind, tags)`. The registry feeds
//! the alert engine through window queries ([`MetricsRegistry::latest`],
//! [`MetricsRegistry::rate`], [`MetricsRegistry::avg`]) and the operational
//! endpoints through [`MetricsRegistry::snapshot`] and the export formats.
//!
//! Counters record their cumulative value as each point, so `rate` over a
//! counter series is the increase divided by elapsed time. Histograms keep a
//! separate raw-value deque for percentile statistics.

pub mod export;
pub mod service;

pub use service::TradeMetrics;

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::utils::time::unix_secs_f64;

/// Points retained per series.
const MAX_POINTS: usize = 1000;

/// Raw observations retained per histogram for percentile statistics.
const MAX_RAW_VALUES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Timer,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
            MetricKind::Timer => "timer",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(MetricKind::Counter),
            "gauge" => Ok(MetricKind::Gauge),
            "histogram" => Ok(MetricKind::Histogram),
            "timer" => Ok(MetricKind::Timer),
            other => Err(format!("unknown metric kind '{}'", other)),
        }
    }
}

/// A single recorded data point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    /// Unix seconds.
    pub timestamp: f64,
    pub value: f64,
}

/// On-demand statistics over a histogram's retained raw values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistogramStats {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub p95: f64,
    pub p99: f64,
    pub stddev: f64,
}

/// One metric series: identity plus the bounded point history.
pub struct Series {
    name: String,
    kind: MetricKind,
    tags: BTreeMap<String, String>,
    /// Current value as f64 bits; cumulative for counters, last set for gauges.
    value: AtomicU64,
    points: Mutex<VecDeque<MetricPoint>>,
    /// Raw observations; populated for histogram series only.
    raw: Mutex<VecDeque<f64>>,
}

impl Series {
    fn new(name: &str, kind: MetricKind, tags: BTreeMap<String, String>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            tags,
            value: AtomicU64::new(0f64.to_bits()),
            points: Mutex::new(VecDeque::new()),
            raw: Mutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn latest(&self) -> Option<MetricPoint> {
        self.points.lock().back().copied()
    }

    fn record_point(&self, value: f64) {
        self.record_point_at(value, unix_secs_f64());
    }

    fn record_point_at(&self, value: f64, timestamp: f64) {
        let mut points = self.points.lock();
        points.push_back(MetricPoint { timestamp, value });
        while points.len() > MAX_POINTS {
            points.pop_front();
        }
    }

    /// Lock-free add; returns the new value. Same CAS shape as the token
    /// bucket's acquire path.
    fn fetch_add_value(&self, delta: f64) -> f64 {
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            let next = f64::from_bits(current) + delta;
            match self.value.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    fn store_value(&self, value: f64) {
        self.value.store(value.to_bits(), Ordering::Release);
    }

    fn load_value(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Acquire))
    }

    fn observe_raw(&self, value: f64) {
        let mut raw = self.raw.lock();
        raw.push_back(value);
        while raw.len() > MAX_RAW_VALUES {
            raw.pop_front();
        }
    }

    /// Statistics over the retained raw values; `None` until something was
    /// observed.
    pub fn stats(&self) -> Option<HistogramStats> {
        let values: Vec<f64> = {
            let raw = self.raw.lock();
            raw.iter().copied().collect()
        };
        if values.is_empty() {
            return None;
        }

        let count = values.len();
        let sum: f64 = values.iter().sum();
        let mean = sum / count as f64;

        let mut sorted = values.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let median = if count % 2 == 0 {
            (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
        } else {
            sorted[count / 2]
        };

        let stddev = if count > 1 {
            let variance: f64 =
                values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
            variance.sqrt()
        } else {
            0.0
        };

        Some(HistogramStats {
            count: count as u64,
            sum,
            min: sorted[0],
            max: sorted[count - 1],
            mean,
            median,
            p95: percentile(&sorted, 0.95),
            p99: percentile(&sorted, 0.99),
            stddev,
        })
    }

    fn evict_before(&self, cutoff: f64) -> usize {
        let mut points = self.points.lock();
        let before = points.len();
        while points.front().map(|p| p.timestamp < cutoff).unwrap_or(false) {
            points.pop_front();
        }
        before - points.len()
    }

    fn points_since(&self, cutoff: f64) -> Vec<MetricPoint> {
        self.points
            .lock()
            .iter()
            .filter(|p| p.timestamp >= cutoff)
            .copied()
            .collect()
    }

    fn snapshot(&self) -> SeriesSnapshot {
        let points: Vec<MetricPoint> = self.points.lock().iter().copied().collect();
        SeriesSnapshot {
            name: self.name.clone(),
            kind: self.kind,
            tags: self.tags.clone(),
            latest: points.last().map(|p| p.value),
            stats: match self.kind {
                MetricKind::Histogram | MetricKind::Timer => self.stats(),
                _ => None,
            },
            points,
        }
    }
}

/// Stable nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = (sorted.len() as f64 * p) as usize;
    sorted[index.min(sorted.len() - 1)]
}

/// Monotonically increasing counter.
#[derive(Clone)]
pub struct Counter {
    series: Arc<Series>,
}

impl Counter {
    pub fn increment(&self) {
        self.add(1.0);
    }

    pub fn add(&self, delta: f64) {
        if delta < 0.0 {
            debug!(
                counter = %self.series.name,
                delta,
                "ignoring negative counter delta"
            );
            return;
        }
        let total = self.series.fetch_add_value(delta);
        self.series.record_point(total);
    }

    pub fn value(&self) -> f64 {
        self.series.load_value()
    }
}

/// Gauge that can move in both directions.
#[derive(Clone)]
pub struct Gauge {
    series: Arc<Series>,
}

impl Gauge {
    pub fn set(&self, value: f64) {
        self.series.store_value(value);
        self.series.record_point(value);
    }

    pub fn increment(&self, delta: f64) {
        let value = self.series.fetch_add_value(delta);
        self.series.record_point(value);
    }

    pub fn decrement(&self, delta: f64) {
        self.increment(-delta);
    }

    pub fn value(&self) -> f64 {
        self.series.load_value()
    }
}

/// Distribution tracker with percentile statistics.
#[derive(Clone)]
pub struct Histogram {
    series: Arc<Series>,
}

impl Histogram {
    pub fn observe(&self, value: f64) {
        self.series.observe_raw(value);
        self.series.record_point(value);
    }

    pub fn stats(&self) -> Option<HistogramStats> {
        self.series.stats()
    }
}

/// Duration tracker writing milliseconds into a `{name}_duration` histogram.
#[derive(Clone)]
pub struct Timer {
    histogram: Histogram,
}

impl Timer {
    /// Scope guard; records the elapsed time when dropped.
    pub fn start(&self) -> TimerGuard {
        TimerGuard {
            histogram: self.histogram.clone(),
            started: Instant::now(),
        }
    }

    pub fn record_ms(&self, millis: f64) {
        self.histogram.observe(millis);
    }

    pub fn record_duration(&self, elapsed: Duration) {
        self.record_ms(elapsed.as_secs_f64() * 1000.0);
    }

    /// Time a future and record its duration.
    pub async fn time<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let started = Instant::now();
        let out = fut.await;
        self.record_duration(started.elapsed());
        out
    }

    pub fn stats(&self) -> Option<HistogramStats> {
        self.histogram.stats()
    }
}

pub struct TimerGuard {
    histogram: Histogram,
    started: Instant,
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.histogram
            .observe(self.started.elapsed().as_secs_f64() * 1000.0);
    }
}

/// Deep-copied registry snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub generated_at: f64,
    pub series: Vec<SeriesSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesSnapshot {
    pub name: String,
    pub kind: MetricKind,
    pub tags: BTreeMap<String, String>,
    pub latest: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<HistogramStats>,
    pub points: Vec<MetricPoint>,
}

/// Central metric store. One per process, shared by `Arc`.
pub struct MetricsRegistry {
    series: DashMap<String, Arc<Series>>,
    descriptions: DashMap<String, String>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            series: DashMap::new(),
            descriptions: DashMap::new(),
        }
    }

    /// Create or fetch a counter for `(name, tags)`.
    pub fn counter(&self, name: &str, tags: &[(&str, &str)]) -> Counter {
        Counter {
            series: self.get_or_create(name, MetricKind::Counter, tags),
        }
    }

    /// Create or fetch a gauge for `(name, tags)`.
    pub fn gauge(&self, name: &str, tags: &[(&str, &str)]) -> Gauge {
        Gauge {
            series: self.get_or_create(name, MetricKind::Gauge, tags),
        }
    }

    /// Create or fetch a histogram for `(name, tags)`.
    pub fn histogram(&self, name: &str, tags: &[(&str, &str)]) -> Histogram {
        Histogram {
            series: self.get_or_create(name, MetricKind::Histogram, tags),
        }
    }

    /// Create or fetch a timer for `(name, tags)`. The recorded durations
    /// live in a histogram series named `{name}_duration`.
    pub fn timer(&self, name: &str, tags: &[(&str, &str)]) -> Timer {
        Timer {
            histogram: Histogram {
                series: self.get_or_create(
                    &format!("{}_duration", name),
                    MetricKind::Histogram,
                    tags,
                ),
            },
        }
    }

    /// Generic recording entry point.
    pub fn record(&self, name: &str, kind: MetricKind, value: f64, tags: &[(&str, &str)]) {
        match kind {
            MetricKind::Counter => self.counter(name, tags).add(value),
            MetricKind::Gauge => self.gauge(name, tags).set(value),
            MetricKind::Histogram => self.histogram(name, tags).observe(value),
            MetricKind::Timer => self.timer(name, tags).record_ms(value),
        }
    }

    /// Attach a help text used by the text export.
    pub fn describe(&self, name: &str, description: &str) {
        self.descriptions
            .insert(name.to_string(), description.to_string());
    }

    fn get_or_create(&self, name: &str, kind: MetricKind, tags: &[(&str, &str)]) -> Arc<Series> {
        let tag_map: BTreeMap<String, String> = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let key = series_key(name, kind, &tag_map);
        self.series
            .entry(key)
            .or_insert_with(|| Arc::new(Series::new(name, kind, tag_map)))
            .clone()
    }

    /// Series whose name matches and whose tags contain every given pair.
    fn matching(&self, name: &str, tags: &[(&str, &str)]) -> Vec<Arc<Series>> {
        self.series
            .iter()
            .filter(|entry| {
                let s = entry.value();
                s.name == name
                    && tags
                        .iter()
                        .all(|(k, v)| s.tags.get(*k).map(|t| t == v).unwrap_or(false))
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Most recent value across series matching `(name, tags)`.
    pub fn latest(&self, name: &str, tags: &[(&str, &str)]) -> Option<f64> {
        self.matching(name, tags)
            .iter()
            .filter_map(|s| s.latest())
            .max_by(|a, b| {
                a.timestamp
                    .partial_cmp(&b.timestamp)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|p| p.value)
    }

    /// Change per second over the window, summed across matching series.
    /// Series with fewer than two in-window points contribute 0.
    pub fn rate(&self, name: &str, window: Duration, tags: &[(&str, &str)]) -> f64 {
        self.rate_at(name, window, tags, unix_secs_f64())
    }

    pub fn rate_at(&self, name: &str, window: Duration, tags: &[(&str, &str)], now: f64) -> f64 {
        let cutoff = now - window.as_secs_f64();
        self.matching(name, tags)
            .iter()
            .map(|s| {
                let points = s.points_since(cutoff);
                match (points.first(), points.last()) {
                    (Some(first), Some(last)) if last.timestamp > first.timestamp => {
                        (last.value - first.value) / (last.timestamp - first.timestamp)
                    }
                    _ => 0.0,
                }
            })
            .sum()
    }

    /// Mean of all in-window points across matching series; 0 when empty.
    pub fn avg(&self, name: &str, window: Duration, tags: &[(&str, &str)]) -> f64 {
        self.avg_at(name, window, tags, unix_secs_f64())
    }

    pub fn avg_at(&self, name: &str, window: Duration, tags: &[(&str, &str)], now: f64) -> f64 {
        let cutoff = now - window.as_secs_f64();
        let mut sum = 0.0;
        let mut count = 0usize;
        for series in self.matching(name, tags) {
            for point in series.points_since(cutoff) {
                sum += point.value;
                count += 1;
            }
        }
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    /// Deep copy of every series, sorted for deterministic export.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut series: Vec<SeriesSnapshot> = self
            .series
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        series.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| a.tags.cmp(&b.tags))
                .then_with(|| a.kind.as_str().cmp(b.kind.as_str()))
        });
        MetricsSnapshot {
            generated_at: unix_secs_f64(),
            series,
        }
    }

    /// Line-oriented text export (`# HELP` / `# TYPE` / value lines).
    pub fn export_text(&self) -> String {
        export::to_text(&self.snapshot(), &self.description_map())
    }

    /// JSON export of the full snapshot.
    pub fn export_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or_else(|_| serde_json::json!({}))
    }

    fn description_map(&self) -> BTreeMap<String, String> {
        self.descriptions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Drop points older than `older_than` from every series.
    pub fn clear_old_points(&self, older_than: Duration) {
        let cutoff = unix_secs_f64() - older_than.as_secs_f64();
        let mut evicted = 0usize;
        for entry in self.series.iter() {
            evicted += entry.value().evict_before(cutoff);
        }
        info!(evicted, older_than_secs = older_than.as_secs(), "cleared old metric points");
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    /// Background eviction task; stops when `stop` flips to true.
    pub fn spawn_eviction(
        self: &Arc<Self>,
        interval: Duration,
        retention: Duration,
        mut stop: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        registry.clear_old_points(retention);
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("metric eviction task stopped");
        })
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn series_key(name: &str, kind: MetricKind, tags: &BTreeMap<String, String>) -> String {
    let mut key = format!("{}:{}", name, kind.as_str());
    for (k, v) in tags {
        key.push(':');
        key.push_str(k);
        key.push('=');
        key.push_str(v);
    }
    key
}
