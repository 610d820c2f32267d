//! Benchmark: Metrics Registry Performance
//!
//! Purpose: Measure the cost of recording metrics from service hot paths
//!
//! What's Measured:
//! - Counter increment through a cached handle (the common case)
//! - Registry lookup plus increment (cold call sites)
//! - Gauge set and histogram observe
//! - Percentile computation over a populated histogram
//! - Windowed rate over a long series
//! - Full text export with many live series
//!
//! Why This Matters:
//! Counters fire on every order, fill, and API request. Recording must
//! stay cheap enough that instrumentation never shows up in latency
//! profiles.

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use grund_core::metrics::MetricsRegistry;

fn bench_counter_increment(c: &mut Criterion) {
    let mut group = c.benchmark_group("metrics");
    group.significance_level(0.01).sample_size(1000);

    let registry = Arc::new(MetricsRegistry::new());
    let counter = registry.counter("bench_orders_total", &[("venue", "sim")]);

    group.bench_function("counter_increment_cached", |b| {
        b.iter(|| {
            counter.increment();
        });
    });

    group.bench_function("counter_lookup_and_increment", |b| {
        b.iter(|| {
            registry
                .counter(black_box("bench_orders_total"), &[("venue", "sim")])
                .increment();
        });
    });

    group.finish();
}

fn bench_gauge_and_histogram(c: &mut Criterion) {
    let mut group = c.benchmark_group("metrics");
    group.significance_level(0.01).sample_size(1000);

    let registry = Arc::new(MetricsRegistry::new());
    let gauge = registry.gauge("bench_queue_depth", &[]);
    let histogram = registry.histogram("bench_latency_ms", &[]);

    group.bench_function("gauge_set", |b| {
        let mut value = 0.0_f64;
        b.iter(|| {
            value += 1.0;
            gauge.set(black_box(value));
        });
    });

    group.bench_function("histogram_observe", |b| {
        b.iter(|| {
            histogram.observe(black_box(4.2));
        });
    });

    group.finish();
}

fn bench_histogram_stats(c: &mut Criterion) {
    let mut group = c.benchmark_group("metrics");
    group.sample_size(200);

    let registry = Arc::new(MetricsRegistry::new());
    let histogram = registry.histogram("bench_percentiles_ms", &[]);
    for i in 0..10_000 {
        histogram.observe((i % 250) as f64 * 0.5);
    }

    group.bench_function("histogram_stats_10k", |b| {
        b.iter(|| black_box(histogram.stats()));
    });

    group.finish();
}

fn bench_windowed_rate(c: &mut Criterion) {
    let mut group = c.benchmark_group("metrics");
    group.sample_size(200);

    let registry = Arc::new(MetricsRegistry::new());
    let counter = registry.counter("bench_rate_total", &[]);
    for _ in 0..5_000 {
        counter.increment();
    }

    group.bench_function("rate_over_5m_window", |b| {
        b.iter(|| {
            black_box(registry.rate("bench_rate_total", Duration::from_secs(300), &[]));
        });
    });

    group.finish();
}

fn bench_export_text(c: &mut Criterion) {
    let mut group = c.benchmark_group("metrics");
    group.sample_size(100);

    let registry = Arc::new(MetricsRegistry::new());
    for i in 0..100 {
        let service = format!("svc_{}", i % 10);
        registry
            .counter(&format!("bench_series_{}_total", i), &[("service", &service)])
            .add(i as f64);
    }

    group.bench_function("export_text_100_series", |b| {
        b.iter(|| black_box(registry.export_text()));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_counter_increment,
    bench_gauge_and_histogram,
    bench_histogram_stats,
    bench_windowed_rate,
    bench_export_text
);
criterion_main!(benches);
