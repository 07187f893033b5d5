//! Metrics collection and exposition.
//!
//! # Metrics
//! - `web_session_connections_total` (counter): accepted connections by `secure`
//! - `web_session_requests_total` (counter): decoded HTTP requests
//! - `web_session_responses_total` (counter): written responses by `status`
//! - `web_session_pipeline_paused_total` (counter): reads paused on a full queue
//! - `web_session_errors_total` (counter): sessions ended by an error, by `kind`
//! - `web_session_ws_active` (gauge): open message sessions
//! - `web_session_ws_messages_total` (counter): messages by `direction`

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter with an HTTP scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connection(secure: bool) {
    counter!("web_session_connections_total", "secure" => if secure { "true" } else { "false" })
        .increment(1);
}

pub fn record_request() {
    counter!("web_session_requests_total").increment(1);
}

pub fn record_response(status: u16) {
    counter!("web_session_responses_total", "status" => status.to_string()).increment(1);
}

pub fn record_pipeline_paused() {
    counter!("web_session_pipeline_paused_total").increment(1);
}

pub fn record_session_error(kind: &'static str) {
    counter!("web_session_errors_total", "kind" => kind).increment(1);
}

pub fn ws_session_opened() {
    gauge!("web_session_ws_active").increment(1.0);
}

pub fn ws_session_closed() {
    gauge!("web_session_ws_active").decrement(1.0);
}

pub fn record_ws_message(direction: &'static str) {
    counter!("web_session_ws_messages_total", "direction" => direction).increment(1);
}
