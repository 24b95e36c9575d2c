//! Prometheus metrics (see SPEC_FULL.md §6)
//!
//! Counters for event throughput and worker outcomes, gauges for live
//! connection state, histograms for latency. Exposed as text at `/metrics`.

use prometheus::{CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub events_published_total: CounterVec,
    pub events_delivered_total: CounterVec,
    pub redis_operations_total: CounterVec,
    pub rate_limit_hits_total: CounterVec,
    pub worker_tasks_total: CounterVec,
    pub active_sse_connections: Gauge,
    pub backpressure_current_slow_clients: Gauge,
    pub worker_dispatch_saturated: Gauge,
    pub sse_connection_duration_seconds: HistogramVec,
    pub http_request_duration_seconds: HistogramVec,
    registry: Arc<Registry>,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let events_published_total = CounterVec::new(
            Opts::new(
                "events_published_total",
                "Events appended to a session's event log",
            ),
            &["event_type"],
        )?;

        let events_delivered_total = CounterVec::new(
            Opts::new(
                "events_delivered_total",
                "Events delivered to an SSE client",
            ),
            &["event_type"],
        )?;

        let redis_operations_total = CounterVec::new(
            Opts::new("redis_operations_total", "Store backend operations"),
            &["operation", "status"],
        )?;

        let rate_limit_hits_total = CounterVec::new(
            Opts::new(
                "rate_limit_hits_total",
                "Requests rejected by the rate limiter",
            ),
            &["endpoint"],
        )?;

        let worker_tasks_total = CounterVec::new(
            Opts::new("worker_tasks_total", "Worker dispatch outcomes"),
            &["name", "status"],
        )?;

        let active_sse_connections = Gauge::new(
            "active_sse_connections",
            "Currently open SSE connections",
        )?;

        let backpressure_current_slow_clients = Gauge::new(
            "backpressure_current_slow_clients",
            "Connections whose buffer depth is past the slow-client threshold",
        )?;

        let worker_dispatch_saturated = Gauge::new(
            "worker_dispatch_saturated",
            "1 when every dispatcher concurrency permit is checked out, else 0",
        )?;

        let sse_connection_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "sse_connection_duration_seconds",
                "SSE connection lifetime in seconds",
            )
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0]),
            &[],
        )?;

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request latency in seconds",
            )
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
            &["method", "endpoint"],
        )?;

        registry.register(Box::new(events_published_total.clone()))?;
        registry.register(Box::new(events_delivered_total.clone()))?;
        registry.register(Box::new(redis_operations_total.clone()))?;
        registry.register(Box::new(rate_limit_hits_total.clone()))?;
        registry.register(Box::new(worker_tasks_total.clone()))?;
        registry.register(Box::new(active_sse_connections.clone()))?;
        registry.register(Box::new(backpressure_current_slow_clients.clone()))?;
        registry.register(Box::new(worker_dispatch_saturated.clone()))?;
        registry.register(Box::new(sse_connection_duration_seconds.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;

        Ok(Self {
            events_published_total,
            events_delivered_total,
            redis_operations_total,
            rate_limit_hits_total,
            worker_tasks_total,
            active_sse_connections,
            backpressure_current_slow_clients,
            worker_dispatch_saturated,
            sse_connection_duration_seconds,
            http_request_duration_seconds,
            registry: Arc::new(registry),
        })
    }

    pub fn record_event_published(&self, event_type: &str) {
        self.events_published_total.with_label_values(&[event_type]).inc();
    }

    pub fn record_event_delivered(&self, event_type: &str) {
        self.events_delivered_total.with_label_values(&[event_type]).inc();
    }

    pub fn record_redis_operation(&self, operation: &str, status: &str) {
        self.redis_operations_total
            .with_label_values(&[operation, status])
            .inc();
    }

    pub fn record_rate_limit_hit(&self, endpoint: &str) {
        self.rate_limit_hits_total.with_label_values(&[endpoint]).inc();
    }

    pub fn record_worker_task(&self, name: &str, status: &str) {
        self.worker_tasks_total.with_label_values(&[name, status]).inc();
    }

    pub fn connection_opened(&self) -> Instant {
        self.active_sse_connections.inc();
        Instant::now()
    }

    pub fn connection_closed(&self, started: Instant) {
        self.active_sse_connections.dec();
        self.sse_connection_duration_seconds
            .with_label_values(&[])
            .observe(started.elapsed().as_secs_f64());
    }

    pub fn set_worker_dispatch_saturated(&self, saturated: bool) {
        self.worker_dispatch_saturated.set(if saturated { 1.0 } else { 0.0 });
    }

    pub fn record_http_request(&self, method: &str, endpoint: &str, started: Instant) {
        self.http_request_duration_seconds
            .with_label_values(&[method, endpoint])
            .observe(started.elapsed().as_secs_f64());
    }

    /// Render the registry as Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let families = self.registry.gather();
        let encoder = TextEncoder::new();
        encoder.encode_to_string(&families)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        assert!(Metrics::new().is_ok());
    }

    #[test]
    fn test_record_event_published_increments_counter() {
        let metrics = Metrics::new().unwrap();
        metrics.record_event_published("trace");
        metrics.record_event_published("trace");
        let samples = metrics.events_published_total.collect();
        assert!(!samples.is_empty());
    }

    #[test]
    fn test_connection_open_close_tracks_gauge_and_histogram() {
        let metrics = Metrics::new().unwrap();
        let start = metrics.connection_opened();
        assert_eq!(metrics.active_sse_connections.get(), 1.0);
        metrics.connection_closed(start);
        assert_eq!(metrics.active_sse_connections.get(), 0.0);
    }

    #[test]
    fn test_render_produces_prometheus_text() {
        let metrics = Metrics::new().unwrap();
        metrics.record_worker_task("dispatch", "completed");
        let rendered = metrics.render().unwrap();
        assert!(rendered.contains("worker_tasks_total"));
    }
}
