//! Prometheus metrics recorder and metric name constants.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::errors::ServerError;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render the `/metrics` endpoint. Fails if a
/// recorder is already installed in this process.
pub fn install_recorder() -> Result<PrometheusHandle, ServerError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ServerError::Metrics(e.to_string()))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

// Metric name constants. The first two are recorded by `relay-core`'s bus.

/// Events published on the bus (counter).
pub const EVENTS_PUBLISHED_TOTAL: &str = "relay_events_published_total";
/// Subscriber callbacks that panicked during fan-out (counter).
pub const SUBSCRIBER_PANICS_TOTAL: &str = "relay_subscriber_panics_total";
/// Stream connections opened (counter).
pub const STREAM_CONNECTIONS_TOTAL: &str = "relay_stream_connections_total";
/// Currently open stream connections (gauge).
pub const STREAM_CONNECTIONS_ACTIVE: &str = "relay_stream_connections_active";
/// Frames dropped because a connection's send queue was full (counter).
pub const STREAM_FRAMES_DROPPED_TOTAL: &str = "relay_stream_frames_dropped_total";
/// Heartbeat frames written (counter).
pub const STREAM_HEARTBEATS_TOTAL: &str = "relay_stream_heartbeats_total";
/// Requests rejected for missing or invalid credentials (counter, labels: route).
pub const AUTH_REJECTIONS_TOTAL: &str = "relay_auth_rejections_total";
/// Streams closed by server shutdown (counter).
pub const STREAM_SHUTDOWN_CLOSES_TOTAL: &str = "relay_stream_shutdown_closes_total";
