//! Metrics collection and exposition.
//!
//! # Metrics
//! - `diameter_connections_accepted_total` (counter)
//! - `diameter_active_connections` (gauge)
//! - `diameter_messages_total` (counter): by direction (`in`, `out`)
//! - `diameter_error_reports_total` (counter): by error kind
//! - `diameter_error_reports_dropped_total` (counter)
//! - `diameter_handler_panics_total` (counter)
//! - `diameter_accept_retries_total` (counter)

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus exporter listening on `addr`.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_connection_accepted() {
    metrics::counter!("diameter_connections_accepted_total").increment(1);
}

pub fn record_active_connections(active: u64) {
    metrics::gauge!("diameter_active_connections").set(active as f64);
}

pub fn record_message(direction: &'static str) {
    metrics::counter!("diameter_messages_total", "direction" => direction).increment(1);
}

pub fn record_error_report(kind: &'static str) {
    metrics::counter!("diameter_error_reports_total", "kind" => kind).increment(1);
}

pub fn record_error_report_dropped() {
    metrics::counter!("diameter_error_reports_dropped_total").increment(1);
}

pub fn record_handler_panic() {
    metrics::counter!("diameter_handler_panics_total").increment(1);
}

pub fn record_accept_retry() {
    metrics::counter!("diameter_accept_retries_total").increment(1);
}
