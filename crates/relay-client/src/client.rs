//! Resilient event stream consumer.
//!
//! A [`StreamClient`] keeps one stream open against the relay endpoint. When
//! the stream fails to open, breaks, or goes quiet past the idle timeout it
//! reconnects with exponential backoff and jitter. The attempt counter resets
//! whenever a stream opens. Once the configured number of reconnects has been
//! spent the client reports [`StreamError::ReconnectExhausted`] through the
//! error handler and stops.
//!
//! A connect that produces no response within the open timeout counts as a
//! failed attempt, the same as a refused one.
//!
//! [`StreamClient::close`] is final: it cancels any pending reconnect, waits
//! for a handler running on another thread to return, and no handler starts
//! after it. Handlers may call `close` themselves.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::ReentrantMutex;
use relay_core::{Event, Frame, FrameDecoder, FrameError};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::backoff::Backoff;
use crate::config::StreamClientConfig;
use crate::errors::StreamError;
use crate::transport::{ByteStream, HttpTransport, Transport};

const EVENT_CHANNEL_CAPACITY: usize = 256;

type MessageHandler = Arc<dyn Fn(&Event) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&StreamError) + Send + Sync>;
type OpenHandler = Arc<dyn Fn() + Send + Sync>;

/// Connection lifecycle as observed through [`StreamClient::status`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Open,
    /// Waiting `delay` before reconnect number `attempt`.
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnect attempts ran out. Terminal.
    Exhausted,
    /// Closed by the caller. Terminal.
    Closed,
}

impl ClientState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exhausted | Self::Closed)
    }
}

#[derive(Default)]
struct Handlers {
    on_message: Option<MessageHandler>,
    on_error: Option<ErrorHandler>,
    on_open: Option<OpenHandler>,
}

pub struct StreamClientBuilder {
    config: StreamClientConfig,
    transport: Option<Arc<dyn Transport>>,
    handlers: Handlers,
}

impl StreamClientBuilder {
    /// Use a custom transport instead of HTTP.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn on_message(mut self, handler: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        self.handlers.on_message = Some(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn on_error(mut self, handler: impl Fn(&StreamError) + Send + Sync + 'static) -> Self {
        self.handlers.on_error = Some(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn on_open(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.handlers.on_open = Some(Arc::new(handler));
        self
    }

    /// Start connecting in the background. Must be called inside a Tokio
    /// runtime.
    pub fn connect(self) -> Result<StreamClient, StreamError> {
        let transport = match self.transport {
            Some(t) => t,
            None => Arc::new(HttpTransport::from_config(&self.config)?),
        };
        let (state_tx, _) = watch::channel(ClientState::Connecting);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let inner = Arc::new(ClientInner {
            backoff: Backoff::from(&self.config),
            config: self.config,
            transport,
            handlers: self.handlers,
            closed: AtomicBool::new(false),
            handler_gate: ReentrantMutex::new(()),
            cancel: CancellationToken::new(),
            attempts: AtomicU32::new(0),
            state_tx,
            events_tx,
        });
        let _ = tokio::spawn(run(Arc::clone(&inner)));
        Ok(StreamClient { inner })
    }
}

/// Handle to a background stream consumer. Dropping it closes the client.
pub struct StreamClient {
    inner: Arc<ClientInner>,
}

impl StreamClient {
    pub fn builder(config: StreamClientConfig) -> StreamClientBuilder {
        StreamClientBuilder {
            config,
            transport: None,
            handlers: Handlers::default(),
        }
    }

    /// Stop for good. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wait out a handler that passed its closed check before the swap.
        drop(self.inner.handler_gate.lock());
        self.inner.cancel.cancel();
        let _ = self.inner.state_tx.send_replace(ClientState::Closed);
        info!(url = %self.inner.config.url, "stream client closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn state(&self) -> ClientState {
        self.inner.state_tx.borrow().clone()
    }

    /// Watch lifecycle transitions.
    pub fn status(&self) -> watch::Receiver<ClientState> {
        self.inner.state_tx.subscribe()
    }

    /// Receive every decoded event, in addition to the message handler.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events_tx.subscribe()
    }

    /// Reconnects scheduled since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> &str {
        &self.inner.config.url
    }

    /// Wait until the client is closed or has given up.
    pub async fn finished(&self) -> ClientState {
        let mut status = self.status();
        let finished = status
            .wait_for(ClientState::is_terminal)
            .await
            .map(|state| state.clone());
        finished.unwrap_or_else(|_| self.state())
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.close();
    }
}

struct ClientInner {
    config: StreamClientConfig,
    backoff: Backoff,
    transport: Arc<dyn Transport>,
    handlers: Handlers,
    closed: AtomicBool,
    /// Held while a handler runs. Reentrant so a handler may close the client.
    handler_gate: ReentrantMutex<()>,
    cancel: CancellationToken,
    attempts: AtomicU32,
    state_tx: watch::Sender<ClientState>,
    events_tx: broadcast::Sender<Event>,
}

impl ClientInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ClientState) {
        if self.is_closed() && state != ClientState::Closed {
            return;
        }
        let _ = self.state_tx.send_replace(state);
    }

    /// Read frames until the stream ends, breaks or the client is closed.
    /// `None` means closed.
    async fn consume(&self, mut chunks: ByteStream) -> Option<StreamError> {
        let mut decoder = FrameDecoder::with_max_frame_bytes(self.config.max_frame_bytes);
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return None,
                next = next_chunk(&mut chunks, self.config.idle_timeout) => next,
            };
            match next {
                Ok(Some(Ok(bytes))) => {
                    for frame in decoder.push_bytes(&bytes) {
                        self.handle_frame(frame);
                    }
                }
                Ok(Some(Err(err))) => return Some(err),
                Ok(None) => {
                    for frame in decoder.finish() {
                        self.handle_frame(frame);
                    }
                    return Some(StreamError::ConnectionClosed);
                }
                Err(limit) => {
                    return Some(StreamError::StreamInterrupted(format!(
                        "no data for {}ms",
                        limit.as_millis()
                    )));
                }
            }
        }
    }

    /// Run `f` unless the client is closed. The check and the call happen
    /// under the handler gate, so `close` cannot slip in between.
    fn dispatch(&self, handler: &str, f: impl FnOnce()) {
        let _gate = self.handler_gate.lock();
        if self.is_closed() {
            return;
        }
        guarded(handler, f);
    }

    fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Data(event) => self.dispatch("on_message", || {
                trace!(event_type = %event.event_type, "event received");
                let _ = self.events_tx.send(event.clone());
                if let Some(handler) = &self.handlers.on_message {
                    handler(&event);
                }
            }),
            Frame::Comment(text) => trace!(comment = %text, "comment frame"),
            Frame::Malformed(err) => {
                let err = malformed(err);
                warn!(error = %err, "ignoring malformed frame");
            }
        }
    }

    fn emit_open(&self) {
        if let Some(handler) = &self.handlers.on_open {
            self.dispatch("on_open", || handler());
        }
    }

    fn emit_error(&self, err: &StreamError) {
        if self.is_closed() {
            return;
        }
        warn!(
            url = %self.config.url,
            error = %err,
            kind = err.error_kind(),
            retryable = err.is_retryable(),
            "stream error"
        );
        if let Some(handler) = &self.handlers.on_error {
            self.dispatch("on_error", || handler(err));
        }
    }

    /// Connect, bounded by the open timeout.
    async fn open(&self) -> Result<ByteStream, StreamError> {
        match self.config.open_timeout {
            Some(limit) => tokio::time::timeout(limit, self.transport.connect())
                .await
                .unwrap_or_else(|_| {
                    Err(StreamError::Network(format!(
                        "no response within {}ms",
                        limit.as_millis()
                    )))
                }),
            None => self.transport.connect().await,
        }
    }
}

async fn run(inner: Arc<ClientInner>) {
    debug!(url = %inner.config.url, "stream client starting");
    loop {
        let connected = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            result = inner.open() => result,
        };

        let failure = match connected {
            Ok(chunks) => {
                inner.attempts.store(0, Ordering::SeqCst);
                inner.set_state(ClientState::Open);
                info!(url = %inner.config.url, "stream open");
                inner.emit_open();
                match inner.consume(chunks).await {
                    Some(err) => err,
                    None => break,
                }
            }
            Err(err) => err,
        };
        if inner.is_closed() {
            break;
        }
        inner.emit_error(&failure);

        let attempts = inner.attempts.load(Ordering::SeqCst);
        if attempts >= inner.config.max_reconnect_attempts {
            warn!(url = %inner.config.url, attempts, "reconnect attempts exhausted");
            inner.set_state(ClientState::Exhausted);
            inner.emit_error(&StreamError::ReconnectExhausted { attempts });
            return;
        }

        let delay = inner.backoff.delay(attempts);
        inner.attempts.store(attempts + 1, Ordering::SeqCst);
        inner.set_state(ClientState::Reconnecting {
            attempt: attempts + 1,
            delay,
        });
        info!(
            attempt = attempts + 1,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnect scheduled"
        );

        tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
        inner.set_state(ClientState::Connecting);
    }
    inner.set_state(ClientState::Closed);
    debug!(url = %inner.config.url, "stream client stopped");
}

async fn next_chunk(
    chunks: &mut ByteStream,
    idle: Option<Duration>,
) -> Result<Option<Result<Bytes, StreamError>>, Duration> {
    match idle {
        Some(limit) => tokio::time::timeout(limit, chunks.next())
            .await
            .map_err(|_| limit),
        None => Ok(chunks.next().await),
    }
}

fn malformed(err: FrameError) -> StreamError {
    match err {
        FrameError::Malformed { reason, raw } => StreamError::MalformedFrame { reason, raw },
        other => StreamError::MalformedFrame {
            reason: other.to_string(),
            raw: String::new(),
        },
    }
}

fn guarded(handler: &str, f: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(handler, "stream client handler panicked");
    }
}
