//! Metrics facade fed by the dispatcher and health supervisor.
//!
//! Thin helpers over the [`metrics`] crate macros so call sites stay
//! one-liners. The exporter is installed once at startup by `main`;
//! everything here is recorder-agnostic and safe to call before
//! installation (recordings are dropped).

use std::net::SocketAddr;

/// Installs the Prometheus exporter with its scrape listener.
pub fn init(addr: SocketAddr) {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus recorder");

    tracing::info!(%addr, "metrics exporter listening");
}

/// Counts a completed dispatch, labeled by outcome.
pub fn record_request(algorithm: &str, backend_id: &str, success: bool) {
    let labels = [
        ("algorithm", algorithm.to_string()),
        ("backend", backend_id.to_string()),
        ("status", if success { "success" } else { "error" }.to_string()),
    ];
    metrics::counter!("loadbalancer_requests_total", &labels).increment(1);
}

/// Records the end-to-end response time of a dispatch, backend included.
pub fn record_response_time(algorithm: &str, backend_id: &str, elapsed_ms: u64) {
    let labels = [
        ("algorithm", algorithm.to_string()),
        ("backend", backend_id.to_string()),
    ];
    metrics::histogram!("loadbalancer_response_time_ms", &labels).record(elapsed_ms as f64);
}

/// Counts a backend selection, for distribution-evenness measurement.
pub fn record_selection(algorithm: &str, backend_id: &str) {
    let labels = [
        ("algorithm", algorithm.to_string()),
        ("backend", backend_id.to_string()),
    ];
    metrics::counter!("loadbalancer_backend_selection_total", &labels).increment(1);
}

/// Counts a dispatch error, labeled by error kind.
pub fn record_error(algorithm: &str, backend_id: &str, kind: &str) {
    let labels = [
        ("algorithm", algorithm.to_string()),
        ("backend", backend_id.to_string()),
        ("error_type", kind.to_string()),
    ];
    metrics::counter!("loadbalancer_errors_total", &labels).increment(1);
}

/// Publishes a backend's current in-flight connection count.
pub fn update_active_connections(backend_id: &str, connections: u32) {
    metrics::gauge!(
        "loadbalancer_active_connections",
        "backend" => backend_id.to_string()
    )
    .set(f64::from(connections));
}

/// Publishes a backend's health state (1 = healthy, 0 = unhealthy).
pub fn update_backend_health(backend_id: &str, healthy: bool) {
    metrics::gauge!(
        "loadbalancer_backend_health",
        "backend" => backend_id.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}
