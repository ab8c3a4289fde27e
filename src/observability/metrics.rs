//! Metrics collection and exposition.
//!
//! # Metrics
//! - `lit_connections_total` (counter): accepted client connections by protocol
//! - `lit_active_connections` (gauge): client connections currently open
//! - `lit_connect_failures_total` (counter): failed outbound dials by protocol
//! - `lit_protocol_errors_total` (counter): framing errors by protocol
//! - `lit_spliced_bytes_total` (counter): bytes relayed by direction
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op
//! - The Prometheus exporter is only installed when enabled in config

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the global Prometheus recorder and serve it over HTTP on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(%addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_connection(protocol: &'static str) {
    metrics::counter!("lit_connections_total", "protocol" => protocol).increment(1);
    metrics::gauge!("lit_active_connections").increment(1.0);
}

pub fn record_connection_closed() {
    metrics::gauge!("lit_active_connections").decrement(1.0);
}

pub fn record_connect_failure(protocol: &'static str) {
    metrics::counter!("lit_connect_failures_total", "protocol" => protocol).increment(1);
}

pub fn record_protocol_error(protocol: &'static str) {
    metrics::counter!("lit_protocol_errors_total", "protocol" => protocol).increment(1);
}

/// `direction` is `upstream` for client-to-target bytes, `downstream` otherwise.
pub fn record_spliced_bytes(direction: &'static str, len: usize) {
    metrics::counter!("lit_spliced_bytes_total", "direction" => direction).increment(len as u64);
}
