//! Prometheus metrics recorder for the gateway.
//!
//! Exposes a standard `/metrics` endpoint that Prometheus can scrape.
//! Each recorder owns its registry, so several gateways (or tests) can live
//! in one process without colliding on registration.

use prometheus::{
    histogram_opts, opts, CounterVec, Encoder, HistogramVec, Registry, TextEncoder,
};

pub struct GatewayMetrics {
    registry: Registry,
    forward_total: CounterVec,
    forward_duration_seconds: HistogramVec,
    token_refresh_total: CounterVec,
    cache_lookups_total: CounterVec,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let forward_total = CounterVec::new(
            opts!("authgate_forward_total", "Forwarded requests by target and outcome"),
            &["target", "status"],
        )
        .expect("metric opts are static");

        let forward_duration_seconds = HistogramVec::new(
            histogram_opts!(
                "authgate_forward_duration_seconds",
                "End-to-end forward latency in seconds",
                vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
            ),
            &["target"],
        )
        .expect("metric opts are static");

        let token_refresh_total = CounterVec::new(
            opts!("authgate_token_refresh_total", "Backend token acquisitions"),
            &["target", "outcome"],
        )
        .expect("metric opts are static");

        let cache_lookups_total = CounterVec::new(
            opts!("authgate_cache_lookups_total", "Response cache lookups"),
            &["result"],
        )
        .expect("metric opts are static");

        for collector in [
            Box::new(forward_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(forward_duration_seconds.clone()),
            Box::new(token_refresh_total.clone()),
            Box::new(cache_lookups_total.clone()),
        ] {
            if let Err(e) = registry.register(collector) {
                tracing::warn!("failed to register metric: {}", e);
            }
        }

        Self {
            registry,
            forward_total,
            forward_duration_seconds,
            token_refresh_total,
            cache_lookups_total,
        }
    }

    /// `status` is the HTTP status code, or an error kind when no response arrived.
    pub fn record_forward(&self, target: &str, status: &str, elapsed_secs: f64) {
        self.forward_total.with_label_values(&[target, status]).inc();
        self.forward_duration_seconds
            .with_label_values(&[target])
            .observe(elapsed_secs);
    }

    pub fn record_token_refresh(&self, target: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.token_refresh_total
            .with_label_values(&[target, outcome])
            .inc();
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cache_lookups_total.with_label_values(&[result]).inc();
    }

    /// Encode all metrics in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            tracing::error!("Failed to encode Prometheus metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Axum handler for `GET /metrics`.
pub async fn metrics_handler(
    axum::extract::State(state): axum::extract::State<std::sync::Arc<crate::AppState>>,
) -> impl axum::response::IntoResponse {
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.metrics.encode(),
    )
}
