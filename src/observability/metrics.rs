//! Metrics collection and exposition.
//!
//! # Metrics
//! - `http_requests_total` (counter): REST requests by method, status, role
//! - `http_request_duration_seconds` (histogram): REST latency
//! - `rpc_request_duration_seconds` (histogram): unary call latency
//! - `rpc_requests_successful_total` / `rpc_requests_failed_total` (counters)
//! - `rpc_streams_total` (counter): streaming calls by method and status
//! - `host_ready` (gauge): 1=all services ready, 0=not ready
//! - `tls_reload_total` (counter): key pair reloads by result
//! - `host_post_start_errors_total` (counter): transport errors after start
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op, so tests need no setup
//! - RPC counters share the status vocabulary of `rpc::status`

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and serve it on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

/// Install the Prometheus recorder without a listener; callers render the
/// handle themselves (for instance from a `/metrics` route).
pub fn install_recorder() -> Result<PrometheusHandle, metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().install_recorder()
}

pub fn record_http_request(method: &str, status: u16, role: &str, start: Instant) {
    let labels = [
        ("method", method.to_string()),
        ("status", status.to_string()),
        ("role", role.to_string()),
    ];
    counter!("http_requests_total", &labels).increment(1);
    histogram!(
        "http_request_duration_seconds",
        "method" => method.to_string(),
        "role" => role.to_string()
    )
    .record(start.elapsed().as_secs_f64());
}

pub fn record_rpc_call(method: &str, role: &str, status: &str, start: Instant) {
    let labels = [
        ("method", method.to_string()),
        ("role", role.to_string()),
        ("status", status.to_string()),
    ];
    histogram!("rpc_request_duration_seconds", &labels).record(start.elapsed().as_secs_f64());
    if status == "Ok" {
        counter!("rpc_requests_successful_total", &labels).increment(1);
    } else {
        counter!("rpc_requests_failed_total", &labels).increment(1);
    }
}

pub fn record_rpc_stream(method: &str, status: &str) {
    counter!(
        "rpc_streams_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_host_ready(host: &str, ready: bool) {
    gauge!("host_ready", "host" => host.to_string()).set(if ready { 1.0 } else { 0.0 });
}

pub fn record_tls_reload(result: &'static str) {
    counter!("tls_reload_total", "result" => result).increment(1);
}

pub fn record_post_start_error(host: &str) {
    counter!("host_post_start_errors_total", "host" => host.to_string()).increment(1);
}
