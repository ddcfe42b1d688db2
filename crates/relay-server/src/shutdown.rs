//! Server shutdown: close every open stream, then stop the listener.
//!
//! Streams are closed through the registry first so each one records
//! [`CloseReason::Server`]. Cancelling the server token afterwards stops the
//! listener and catches any stream accepted in between, since every
//! connection holds a child of that token.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metrics::STREAM_SHUTDOWN_CLOSES_TOTAL;
use crate::registry::ConnectionRegistry;
use crate::stream::CloseReason;

/// How long [`ShutdownCoordinator::graceful_shutdown`] waits for the
/// listener when no timeout is given.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// What a shutdown did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Streams closed by this shutdown.
    pub streams_closed: usize,
    /// The listener task was still running when the timeout elapsed.
    pub timed_out: bool,
}

pub struct ShutdownCoordinator {
    token: CancellationToken,
    registry: Arc<ConnectionRegistry>,
}

impl ShutdownCoordinator {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            token: CancellationToken::new(),
            registry,
        }
    }

    /// Token the listener stops on.
    pub fn listener_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Token for one stream connection: cancelled with the server, but
    /// cancellable on its own.
    pub fn connection_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Close every registered stream and stop accepting new ones. Returns
    /// the number of streams this call closed. Later calls close nothing.
    pub fn initiate(&self) -> usize {
        let closed = self.registry.close_all(CloseReason::Server);
        self.token.cancel();
        if closed > 0 {
            counter!(STREAM_SHUTDOWN_CLOSES_TOTAL).increment(closed as u64);
        }
        closed
    }

    /// [`initiate`](Self::initiate), then wait up to `timeout` for the
    /// listener task to finish.
    pub async fn graceful_shutdown(
        &self,
        listener: JoinHandle<()>,
        timeout: Option<Duration>,
    ) -> ShutdownReport {
        let timeout = timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        let streams_closed = self.initiate();
        info!(
            streams_closed,
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "relay server draining"
        );

        let timed_out = tokio::time::timeout(timeout, listener).await.is_err();
        if timed_out {
            warn!(?timeout, "listener did not stop in time");
        }
        ShutdownReport {
            streams_closed,
            timed_out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::config::ConnectionConfig;
    use crate::stream::{FrameStream, StreamConnection};
    use relay_core::EventBus;

    fn open(
        coord: &ShutdownCoordinator,
        bus: &EventBus,
        registry: &Arc<ConnectionRegistry>,
    ) -> (Arc<StreamConnection>, FrameStream) {
        StreamConnection::open(
            Identity {
                subject: "token:0".into(),
            },
            bus,
            &ConnectionConfig::default(),
            coord.connection_token(),
            Some(registry),
        )
    }

    #[test]
    fn cancelling_one_connection_leaves_server_running() {
        let coord = ShutdownCoordinator::new(Arc::new(ConnectionRegistry::new()));
        let conn = coord.connection_token();
        conn.cancel();
        assert!(!coord.is_shutting_down());
        assert!(!coord.listener_token().is_cancelled());
    }

    #[tokio::test]
    async fn initiate_closes_streams_with_server_reason() {
        let bus = EventBus::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let coord = ShutdownCoordinator::new(Arc::clone(&registry));
        let (a, _body_a) = open(&coord, &bus, &registry);
        let (b, _body_b) = open(&coord, &bus, &registry);
        let conn_token = coord.connection_token();

        assert_eq!(coord.initiate(), 2);

        assert!(coord.is_shutting_down());
        assert!(conn_token.is_cancelled());
        assert_eq!(a.close_reason(), Some(CloseReason::Server));
        assert_eq!(b.close_reason(), Some(CloseReason::Server));
        assert_eq!(registry.count(), 0);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(coord.initiate(), 0);
    }

    #[tokio::test]
    async fn graceful_shutdown_waits_for_listener() {
        let coord = ShutdownCoordinator::new(Arc::new(ConnectionRegistry::new()));
        let token = coord.listener_token();
        let listener = tokio::spawn(async move {
            token.cancelled().await;
        });

        let report = coord.graceful_shutdown(listener, None).await;
        assert_eq!(report, ShutdownReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_shutdown_reports_stuck_listener() {
        let bus = EventBus::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let coord = ShutdownCoordinator::new(Arc::clone(&registry));
        let (_conn, _body) = open(&coord, &bus, &registry);
        let listener = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let report = coord
            .graceful_shutdown(listener, Some(Duration::from_millis(50)))
            .await;
        assert_eq!(
            report,
            ShutdownReport {
                streams_closed: 1,
                timed_out: true,
            }
        );
    }
}
