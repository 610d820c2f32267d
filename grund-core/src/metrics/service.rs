//! Predefined instrument set shared by the trading services.

use crate::metrics::{Counter, Gauge, MetricsRegistry, Timer};

/// Standard instruments every service registers at startup, tagged with the
/// service name. The default alert rules reference these metric names.
pub struct TradeMetrics {
    pub orders_placed: Counter,
    pub orders_failed: Counter,
    pub data_fetches: Counter,
    pub db_queries: Counter,
    pub api_requests: Counter,
    pub errors: Counter,
    pub order_processing: Timer,
    pub api_response: Timer,
    pub active_connections: Gauge,
    pub memory_usage: Gauge,
}

impl TradeMetrics {
    pub fn new(registry: &MetricsRegistry, service: &str) -> Self {
        registry.describe("trade_orders_placed_total", "Total number of orders placed");
        registry.describe("trade_orders_failed_total", "Total number of failed orders");
        registry.describe(
            "trade_data_fetches_total",
            "Total number of data fetch operations",
        );
        registry.describe("trade_db_queries_total", "Total number of database queries");
        registry.describe("trade_api_requests_total", "Total number of API requests");
        registry.describe("trade_errors_total", "Total number of errors");
        registry.describe(
            "trade_order_processing_duration",
            "Time taken to process orders in milliseconds",
        );
        registry.describe(
            "trade_api_response_duration",
            "API response time in milliseconds",
        );
        registry.describe("trade_active_connections", "Number of active connections");
        registry.describe("trade_memory_usage_bytes", "Memory usage in bytes");

        let tags = [("service", service)];
        Self {
            orders_placed: registry.counter("trade_orders_placed_total", &tags),
            orders_failed: registry.counter("trade_orders_failed_total", &tags),
            data_fetches: registry.counter("trade_data_fetches_total", &tags),
            db_queries: registry.counter("trade_db_queries_total", &tags),
            api_requests: registry.counter("trade_api_requests_total", &tags),
            errors: registry.counter("trade_errors_total", &tags),
            order_processing: registry.timer("trade_order_processing", &tags),
            api_response: registry.timer("trade_api_response", &tags),
            active_connections: registry.gauge("trade_active_connections", &tags),
            memory_usage: registry.gauge("trade_memory_usage_bytes", &tags),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruments_are_tagged_with_service() {
        let registry = MetricsRegistry::new();
        let metrics = TradeMetrics::new(&registry, "trade");
        metrics.orders_placed.increment();
        metrics.errors.add(2.0);

        // untagged lookups still find the tagged series
        assert_eq!(registry.latest("trade_orders_placed_total", &[]), Some(1.0));
        assert_eq!(
            registry.latest("trade_errors_total", &[("service", "trade")]),
            Some(2.0)
        );
        assert_eq!(
            registry.latest("trade_errors_total", &[("service", "user")]),
            None
        );
    }

    #[test]
    fn test_timers_write_duration_histograms() {
        let registry = MetricsRegistry::new();
        let metrics = TradeMetrics::new(&registry, "trade");
        metrics.api_response.record_ms(120.0);
        assert_eq!(
            registry.latest("trade_api_response_duration", &[]),
            Some(120.0)
        );
        let stats = metrics.api_response.stats().unwrap();
        assert_eq!(stats.count, 1);
    }

    #[test]
    fn test_separate_services_get_separate_series() {
        let registry = MetricsRegistry::new();
        let trade = TradeMetrics::new(&registry, "trade");
        let user = TradeMetrics::new(&registry, "user");
        trade.api_requests.add(10.0);
        user.api_requests.add(1.0);
        assert_eq!(
            registry.latest("trade_api_requests_total", &[("service", "user")]),
            Some(1.0)
        );
    }
}
