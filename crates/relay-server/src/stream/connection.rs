//! One long-lived stream connection.
//!
//! Lifecycle is `Open -> Closed`, a single transition guarded by a
//! compare-and-swap. Any number of triggers (client disconnect, failed
//! write, failed heartbeat, server shutdown, explicit close) may race;
//! exactly one runs teardown, in this order: stop the heartbeat, drop the
//! bus subscription, close the outbound queue.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use relay_core::frame::{self, CONNECTED_FRAME, HEARTBEAT_FRAME};
use relay_core::ids::ConnectionId;
use relay_core::{Event, EventBus, Subscription};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::body::FrameStream;
use super::heartbeat;
use crate::auth::Identity;
use crate::config::ConnectionConfig;
use crate::metrics::{
    STREAM_CONNECTIONS_ACTIVE, STREAM_CONNECTIONS_TOTAL, STREAM_FRAMES_DROPPED_TOTAL,
    STREAM_HEARTBEATS_TOTAL,
};
use crate::registry::ConnectionRegistry;

/// Why a connection was closed. Only the first trigger is recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The response body was dropped (client went away).
    ClientDisconnected,
    /// An event write found the outbound queue closed.
    TransportGone,
    /// A heartbeat write found the outbound queue closed.
    HeartbeatFailed,
    /// The connection's cancellation token fired.
    Cancelled,
    /// Closed by server code, including shutdown.
    Server,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientDisconnected => "client_disconnected",
            Self::TransportGone => "transport_gone",
            Self::HeartbeatFailed => "heartbeat_failed",
            Self::Cancelled => "cancelled",
            Self::Server => "server",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single frame write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Sent,
    /// The send queue was full; the frame was discarded.
    Dropped,
    /// The connection or its transport is closed; nothing was written.
    Closed,
}

pub struct StreamConnection {
    id: ConnectionId,
    identity: Identity,
    connected_at: Instant,
    closed: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    cancel: CancellationToken,
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    subscription: Mutex<Option<Subscription>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    registry: Weak<ConnectionRegistry>,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl StreamConnection {
    /// Open a connection and return it with the response body that carries
    /// its frames. Dropping the body closes the connection.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        identity: Identity,
        bus: &EventBus,
        config: &ConnectionConfig,
        cancel: CancellationToken,
        registry: Option<&Arc<ConnectionRegistry>>,
    ) -> (Arc<Self>, FrameStream) {
        let (conn, rx) = Self::open_with_receiver(identity, bus, config, cancel, registry);
        let body = FrameStream::new(rx, Arc::clone(&conn));
        (conn, body)
    }

    /// Like [`open`](Self::open) but hands out the raw outbound receiver.
    pub(crate) fn open_with_receiver(
        identity: Identity,
        bus: &EventBus,
        config: &ConnectionConfig,
        cancel: CancellationToken,
        registry: Option<&Arc<ConnectionRegistry>>,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(config.send_queue_capacity.max(1));
        let conn = Arc::new(Self {
            id: ConnectionId::new(),
            identity,
            connected_at: Instant::now(),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            cancel,
            tx: Mutex::new(Some(tx)),
            subscription: Mutex::new(None),
            heartbeat: Mutex::new(None),
            registry: registry.map(Arc::downgrade).unwrap_or_default(),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        });
        counter!(STREAM_CONNECTIONS_TOTAL).increment(1);
        gauge!(STREAM_CONNECTIONS_ACTIVE).increment(1.0);

        // The marker goes out before the subscription exists, so it always
        // precedes the first data frame.
        let _ = conn.try_write(Bytes::from_static(CONNECTED_FRAME.as_bytes()));

        let weak = Arc::downgrade(&conn);
        let subscription = bus.subscribe(move |event| {
            if let Some(conn) = weak.upgrade() {
                conn.deliver(event);
            }
        });
        *conn.subscription.lock() = Some(subscription);

        if let Some(registry) = registry {
            registry.insert(Arc::clone(&conn));
        }

        let handle = tokio::spawn(heartbeat::supervise(
            Arc::downgrade(&conn),
            config.heartbeat_interval,
            conn.cancel.clone(),
        ));
        *conn.heartbeat.lock() = Some(handle);
        // Cancellation may already have closed us before the handle was stored.
        if conn.is_closed() {
            if let Some(handle) = conn.heartbeat.lock().take() {
                handle.abort();
            }
        }

        info!(
            connection_id = %conn.id,
            subject = %conn.identity.subject,
            "stream connection opened"
        );
        (conn, rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The trigger that closed this connection, once closed.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> std::time::Duration {
        self.connected_at.elapsed()
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Close the connection. Returns `true` only for the call that performed
    /// teardown; later or concurrent calls are no-ops.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *self.close_reason.lock() = Some(reason);

        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }

        let subscription = self.subscription.lock().take();
        drop(subscription);

        // Dropping the sender ends the body once buffered frames drain;
        // cancelling ends it immediately.
        drop(self.tx.lock().take());
        self.cancel.cancel();

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
        gauge!(STREAM_CONNECTIONS_ACTIVE).decrement(1.0);

        info!(
            connection_id = %self.id,
            reason = %reason,
            frames_sent = self.frames_sent(),
            frames_dropped = self.frames_dropped(),
            duration_ms = self.connected_at.elapsed().as_millis() as u64,
            "stream connection closed"
        );
        true
    }

    /// Write a frame; a closed transport closes the connection.
    pub fn write_frame(&self, frame: Bytes) -> WriteOutcome {
        let outcome = self.try_write(frame);
        if outcome == WriteOutcome::Closed {
            let _ = self.close(CloseReason::TransportGone);
        }
        outcome
    }

    pub(crate) fn send_heartbeat(&self) -> WriteOutcome {
        let outcome = self.try_write(Bytes::from_static(HEARTBEAT_FRAME.as_bytes()));
        if outcome == WriteOutcome::Sent {
            counter!(STREAM_HEARTBEATS_TOTAL).increment(1);
        }
        outcome
    }

    fn deliver(&self, event: &Event) {
        if self.is_closed() {
            return;
        }
        match frame::encode_event(event) {
            Ok(frame) => {
                let _ = self.write_frame(Bytes::from(frame));
            }
            Err(e) => warn!(
                connection_id = %self.id,
                event_type = %event.event_type,
                error = %e,
                "failed to encode event, skipping"
            ),
        }
    }

    fn try_write(&self, frame: Bytes) -> WriteOutcome {
        if self.is_closed() {
            return WriteOutcome::Closed;
        }
        let result = match self.tx.lock().as_ref() {
            Some(tx) => tx.try_send(frame),
            None => return WriteOutcome::Closed,
        };

        match result {
            Ok(()) => {
                let _ = self.frames_sent.fetch_add(1, Ordering::Relaxed);
                WriteOutcome::Sent
            }
            Err(TrySendError::Full(frame)) => {
                let _ = self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                counter!(STREAM_FRAMES_DROPPED_TOTAL).increment(1);
                warn!(
                    connection_id = %self.id,
                    frame_len = frame.len(),
                    "send queue full, dropping frame"
                );
                WriteOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection_id = %self.id, "outbound queue closed");
                WriteOutcome::Closed
            }
        }
    }
}

impl fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConnection")
            .field("id", &self.id)
            .field("subject", &self.identity.subject)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use relay_core::EventKind;
    use std::time::Duration;

    fn identity() -> Identity {
        Identity {
            subject: "token:0".into(),
        }
    }

    fn config(capacity: usize) -> ConnectionConfig {
        ConnectionConfig {
            heartbeat_interval: Duration::from_secs(30),
            send_queue_capacity: capacity,
        }
    }

    fn text(frame: Bytes) -> String {
        String::from_utf8(frame.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn connected_marker_precedes_events() {
        let bus = EventBus::new();
        let (conn, mut rx) = StreamConnection::open_with_receiver(
            identity(),
            &bus,
            &config(16),
            CancellationToken::new(),
            None,
        );

        assert_eq!(bus.publish(&Event::task_created("b1", "t1")), 1);

        assert_eq!(text(rx.recv().await.unwrap()), ": connected\n\n");
        assert_eq!(
            text(rx.recv().await.unwrap()),
            "data: {\"type\":\"task_created\",\"payload\":{\"boardId\":\"b1\",\"taskId\":\"t1\"}}\n\n"
        );
        assert_eq!(conn.frames_sent(), 2);
        conn.close(CloseReason::Server);
    }

    #[tokio::test]
    async fn close_unsubscribes_and_stops_writes() {
        let bus = EventBus::new();
        let (conn, mut rx) = StreamConnection::open_with_receiver(
            identity(),
            &bus,
            &config(16),
            CancellationToken::new(),
            None,
        );
        assert_eq!(bus.subscriber_count(), 1);

        assert!(conn.close(CloseReason::Server));
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(&Event::activity_new("comment")), 0);
        assert_eq!(conn.write_frame(Bytes::from_static(b": x\n\n")), WriteOutcome::Closed);

        // Only the connected marker was ever queued.
        assert_eq!(text(rx.recv().await.unwrap()), ": connected\n\n");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_closes_run_teardown_once() {
        let bus = EventBus::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let (conn, _rx) = StreamConnection::open_with_receiver(
            identity(),
            &bus,
            &config(16),
            CancellationToken::new(),
            Some(&registry),
        );
        assert_eq!(registry.count(), 1);

        let reasons = [
            CloseReason::ClientDisconnected,
            CloseReason::TransportGone,
            CloseReason::HeartbeatFailed,
            CloseReason::Cancelled,
            CloseReason::Server,
        ];
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let conn = Arc::clone(&conn);
                let reason = reasons[i % reasons.len()];
                tokio::spawn(async move { conn.close(reason) })
            })
            .collect();

        let mut performed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                performed += 1;
            }
        }

        assert_eq!(performed, 1);
        assert!(conn.is_closed());
        assert!(conn.close_reason().is_some());
        assert_eq!(registry.count(), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn write_to_gone_transport_closes_without_affecting_others() {
        let bus = EventBus::new();
        let (gone, rx) = StreamConnection::open_with_receiver(
            identity(),
            &bus,
            &config(16),
            CancellationToken::new(),
            None,
        );
        let (alive, mut alive_rx) = StreamConnection::open_with_receiver(
            identity(),
            &bus,
            &config(16),
            CancellationToken::new(),
            None,
        );
        drop(rx);

        let delivered = bus.publish(&Event::board(EventKind::BoardUpdated, "b1"));

        assert_eq!(delivered, 2);
        assert!(gone.is_closed());
        assert_eq!(gone.close_reason(), Some(CloseReason::TransportGone));
        assert!(!alive.is_closed());
        assert_eq!(bus.subscriber_count(), 1);

        let _connected = alive_rx.recv().await.unwrap();
        assert!(text(alive_rx.recv().await.unwrap()).starts_with("data: "));
        alive.close(CloseReason::Server);
    }

    #[tokio::test]
    async fn full_queue_drops_frames_but_stays_open() {
        let bus = EventBus::new();
        let (conn, mut rx) = StreamConnection::open_with_receiver(
            identity(),
            &bus,
            &config(2),
            CancellationToken::new(),
            None,
        );

        // Capacity 2: the connected marker plus one event fit.
        for i in 0..5 {
            bus.publish(&Event::task_created("b1", &format!("t{i}")));
        }

        assert!(!conn.is_closed());
        assert_eq!(conn.frames_sent(), 2);
        assert_eq!(conn.frames_dropped(), 4);

        let _connected = rx.recv().await.unwrap();
        assert!(text(rx.recv().await.unwrap()).contains("\"taskId\":\"t0\""));
        conn.close(CloseReason::Server);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_written_every_interval() {
        let bus = EventBus::new();
        let (conn, mut rx) = StreamConnection::open_with_receiver(
            identity(),
            &bus,
            &config(16),
            CancellationToken::new(),
            None,
        );
        assert_eq!(text(rx.recv().await.unwrap()), ": connected\n\n");

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert_eq!(text(rx.try_recv().unwrap()), ": heartbeat\n\n");

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(text(rx.try_recv().unwrap()), ": heartbeat\n\n");
        conn.close(CloseReason::Server);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_heartbeat_closes_connection() {
        let bus = EventBus::new();
        let (conn, rx) = StreamConnection::open_with_receiver(
            identity(),
            &bus,
            &config(16),
            CancellationToken::new(),
            None,
        );
        drop(rx);

        tokio::time::sleep(Duration::from_secs(31)).await;

        assert!(conn.is_closed());
        assert_eq!(conn.close_reason(), Some(CloseReason::HeartbeatFailed));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_heartbeat_after_close() {
        let bus = EventBus::new();
        let (conn, mut rx) = StreamConnection::open_with_receiver(
            identity(),
            &bus,
            &config(16),
            CancellationToken::new(),
            None,
        );
        conn.close(CloseReason::Server);

        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(text(rx.recv().await.unwrap()), ": connected\n\n");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn parent_cancellation_closes_connection() {
        let bus = EventBus::new();
        let parent = CancellationToken::new();
        let (conn, _rx) = StreamConnection::open_with_receiver(
            identity(),
            &bus,
            &config(16),
            parent.child_token(),
            None,
        );

        parent.cancel();
        for _ in 0..10 {
            if conn.is_closed() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(conn.is_closed());
        assert_eq!(conn.close_reason(), Some(CloseReason::Cancelled));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dropping_body_closes_connection() {
        let bus = EventBus::new();
        let (conn, mut body) = StreamConnection::open(
            identity(),
            &bus,
            &config(16),
            CancellationToken::new(),
            None,
        );

        let first = body.next().await.unwrap().unwrap();
        assert_eq!(text(first), ": connected\n\n");
        drop(body);

        assert!(conn.is_closed());
        assert_eq!(conn.close_reason(), Some(CloseReason::ClientDisconnected));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn body_ends_after_close() {
        let bus = EventBus::new();
        let (conn, mut body) = StreamConnection::open(
            identity(),
            &bus,
            &config(16),
            CancellationToken::new(),
            None,
        );
        conn.close(CloseReason::Server);

        // Cancellation ends the body even with frames still buffered.
        let rest: Vec<_> = body.by_ref().collect().await;
        assert!(rest.len() <= 1);
        assert!(body.next().await.is_none());
    }
}
