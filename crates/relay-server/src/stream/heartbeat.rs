//! Periodic `: heartbeat` comment frames.
//!
//! The heartbeat task is also the connection's cancellation watcher: when
//! the connection token fires it closes the connection.

use std::sync::Weak;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::connection::{CloseReason, StreamConnection, WriteOutcome};

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The connection token was cancelled.
    Cancelled,
    /// A heartbeat write found the transport closed.
    WriteFailed,
    /// The connection itself was dropped.
    ConnectionGone,
}

/// Write a heartbeat every `interval` until cancelled or a write fails.
///
/// The first heartbeat goes out one full interval after start. A full send
/// queue skips the tick without failing.
pub async fn run_heartbeat(
    connection: Weak<StreamConnection>,
    interval: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(conn) = connection.upgrade() else {
                    return HeartbeatResult::ConnectionGone;
                };
                if conn.send_heartbeat() == WriteOutcome::Closed {
                    return HeartbeatResult::WriteFailed;
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}

/// Run the heartbeat and close the connection when it stops.
pub(crate) async fn supervise(
    connection: Weak<StreamConnection>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let result = run_heartbeat(connection.clone(), interval, cancel).await;
    let reason = match result {
        HeartbeatResult::Cancelled => CloseReason::Cancelled,
        HeartbeatResult::WriteFailed => CloseReason::HeartbeatFailed,
        HeartbeatResult::ConnectionGone => return,
    };
    if let Some(conn) = connection.upgrade() {
        let _ = conn.close(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_before_first_tick() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_heartbeat(Weak::new(), Duration::from_secs(30), cancel).await;
        assert_eq!(result, HeartbeatResult::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_connection_ends_loop() {
        let result = run_heartbeat(
            Weak::new(),
            Duration::from_millis(100),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(result, HeartbeatResult::ConnectionGone);
    }
}
