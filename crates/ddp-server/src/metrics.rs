//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called at most once per process, before metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ddp_connections_total";
/// WebSocket disconnections total (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ddp_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ddp_connections_active";
/// Upgrades refused because the server was full (counter).
pub const WS_CONNECTIONS_REJECTED_TOTAL: &str = "ddp_connections_rejected_total";
/// Connection lifetime seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ddp_connection_duration_seconds";
/// Inbound frames total (counter, labels: msg).
pub const FRAMES_RECEIVED_TOTAL: &str = "ddp_frames_received_total";
/// Protocol errors reported to clients (counter, labels: reason).
pub const PROTOCOL_ERRORS_TOTAL: &str = "ddp_protocol_errors_total";
/// Outbound frames dropped because the connection was gone (counter).
pub const FRAMES_DROPPED_TOTAL: &str = "ddp_frames_dropped_total";
/// Method calls total (counter, labels: method).
pub const METHOD_CALLS_TOTAL: &str = "ddp_method_calls_total";
/// Method errors total (counter, labels: method, error_type).
pub const METHOD_ERRORS_TOTAL: &str = "ddp_method_errors_total";
/// Method duration seconds (histogram, labels: method).
pub const METHOD_DURATION_SECONDS: &str = "ddp_method_duration_seconds";
/// Active subscriptions (gauge).
pub const SUBSCRIPTIONS_ACTIVE: &str = "ddp_subscriptions_active";
/// Subscriptions started total (counter, labels: publication).
pub const SUBSCRIPTIONS_TOTAL: &str = "ddp_subscriptions_total";
/// Connections closed for unanswered pings (counter).
pub const HEARTBEAT_EVICTIONS_TOTAL: &str = "ddp_heartbeat_evictions_total";
