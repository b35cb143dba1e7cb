//! Prometheus metrics for the AgentOAuth gateway
//!
//! Exposes metrics at GET /metrics in Prometheus text format.
//! Uses the `metrics` crate with the prometheus exporter.

use axum::{routing::get, Router};
use metrics::{counter, histogram};
use std::sync::Arc;

/// Initialize the Prometheus metrics exporter and install it as the global
/// recorder. Returns the handle for rendering metrics on /metrics.
pub fn init_metrics() -> metrics_exporter_prometheus::PrometheusHandle {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder")
}

/// Create a metrics route that can be merged into any Router
pub fn routes<S: Clone + Send + Sync + 'static>(
    handle: metrics_exporter_prometheus::PrometheusHandle,
) -> Router<S> {
    let handle = Arc::new(handle);
    Router::new().route(
        "/metrics",
        get(move || {
            let h = handle.clone();
            async move { h.render() }
        }),
    )
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record an evaluator request
pub fn record_request(endpoint: &str, status: u16) {
    counter!("verify_requests_total", "endpoint" => endpoint.to_string(), "status" => status.to_string())
        .increment(1);
}

/// Record request latency
pub fn record_latency(endpoint: &str, duration_secs: f64) {
    histogram!("request_duration_seconds", "endpoint" => endpoint.to_string())
        .record(duration_secs);
}

/// Record a decision outcome
pub fn record_decision(decision: &str) {
    counter!("decisions_total", "decision" => decision.to_string()).increment(1);
}

/// Record a rate-limited request
pub fn record_rate_limited(band: &str) {
    counter!("rate_limited_total", "band" => band.to_string()).increment(1);
}

/// Record a revocation write
pub fn record_revocation() {
    counter!("revocations_total").increment(1);
}

/// Record a receipt that could not be signed or stored
pub fn record_receipt_omitted() {
    counter!("receipts_omitted_total").increment(1);
}
