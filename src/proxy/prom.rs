//! Prometheus metrics for the proxy.
//!
//! Counters register into a caller-supplied `prometheus::Registry`, so an
//! embedding process can bring its own registry; the binary creates one and
//! hands it to the internal metrics server.

use prometheus::{self, Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// All Prometheus metrics for the proxy.
///
/// Cheap to clone (all inner types are `Arc`-based).
#[derive(Clone)]
pub struct ProxyMetrics {
    registry: Registry,

    /// Total handled requests, by route/method/status code.
    pub requests_total: IntCounterVec,

    /// Currently active client connections.
    pub connections_active: IntGauge,
}

impl ProxyMetrics {
    /// Create all metrics and register them into `registry`.
    pub fn register(registry: Registry) -> Self {
        let requests_total = IntCounterVec::new(
            Opts::new(
                "prom_label_proxy_requests_total",
                "Total requests handled by the proxy",
            ),
            &["route", "method", "code"],
        )
        .expect("metric can be created");
        registry
            .register(Box::new(requests_total.clone()))
            .expect("metric can be registered");

        let connections_active = IntGauge::with_opts(Opts::new(
            "prom_label_proxy_connections_active",
            "Currently active client connections",
        ))
        .expect("metric can be created");
        registry
            .register(Box::new(connections_active.clone()))
            .expect("metric can be registered");

        Self {
            registry,
            requests_total,
            connections_active,
        }
    }

    pub fn new() -> Self {
        Self::register(Registry::new())
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        encoder
            .encode(&metric_families, &mut buf)
            .expect("encoding metrics");
        String::from_utf8(buf).expect("metrics are valid UTF-8")
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the active connection gauge on drop.
pub struct ConnectionGuard {
    gauge: IntGauge,
}

impl ConnectionGuard {
    pub fn new(metrics: &ProxyMetrics) -> Self {
        metrics.connections_active.inc();
        Self {
            gauge: metrics.connections_active.clone(),
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
