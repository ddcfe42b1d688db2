//! `/health` endpoint body.

use std::time::Instant;

use relay_core::EventBus;
use serde::Serialize;

use crate::config::ConnectionConfig;
use crate::registry::ConnectionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    /// Shutdown has begun; new streams are refused.
    Draining,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub uptime_secs: u64,
    /// Open stream connections.
    pub connections: usize,
    /// Every bus subscriber, stream connections included.
    pub subscribers: usize,
    /// Subscribers that are not stream connections.
    pub local_subscribers: usize,
    pub heartbeat_interval_ms: u64,
    pub send_queue_capacity: usize,
}

impl HealthResponse {
    pub fn is_ok(&self) -> bool {
        self.status == HealthStatus::Ok
    }
}

/// Snapshot the relay's live state.
pub fn health_check(
    start_time: Instant,
    registry: &ConnectionRegistry,
    bus: &EventBus,
    connection: &ConnectionConfig,
    draining: bool,
) -> HealthResponse {
    let connections = registry.count();
    let subscribers = bus.subscriber_count();
    HealthResponse {
        status: if draining {
            HealthStatus::Draining
        } else {
            HealthStatus::Ok
        },
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        subscribers,
        local_subscribers: subscribers.saturating_sub(connections),
        heartbeat_interval_ms: u64::try_from(connection.heartbeat_interval.as_millis())
            .unwrap_or(u64::MAX),
        send_queue_capacity: connection.send_queue_capacity,
    }
}
