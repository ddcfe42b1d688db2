use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use relay_core::frame::{encode_event, CONNECTED_FRAME, HEARTBEAT_FRAME};
use relay_core::Event;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{ByteStream, Transport};
use crate::errors::StreamError;

enum Scripted {
    Fail(StreamError),
    Open(mpsc::UnboundedReceiver<Result<Bytes, StreamError>>),
    /// The server accepts the connection but never responds.
    Stall,
}

/// In-process transport driven by a script of connect outcomes.
///
/// Each `connect` pops the next scripted outcome. An exhausted script fails
/// every further attempt with a network error.
#[derive(Default)]
pub struct MemoryTransport {
    script: Mutex<VecDeque<Scripted>>,
    connects: Mutex<Vec<Instant>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failed connect.
    pub fn push_failure(&self, err: StreamError) {
        self.script.lock().push_back(Scripted::Fail(err));
    }

    /// Queue a successful connect and return the handle that feeds it.
    pub fn push_stream(&self) -> MemoryStreamHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script.lock().push_back(Scripted::Open(rx));
        MemoryStreamHandle { tx }
    }

    /// Queue a connect that never completes.
    pub fn push_stall(&self) {
        self.script.lock().push_back(Scripted::Stall);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().len()
    }

    /// Instants at which each connect was attempted.
    pub fn connect_times(&self) -> Vec<Instant> {
        self.connects.lock().clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<ByteStream, StreamError> {
        self.connects.lock().push(Instant::now());
        let next = self.script.lock().pop_front();
        match next {
            Some(Scripted::Open(rx)) => Ok(Box::pin(UnboundedReceiverStream::new(rx))),
            Some(Scripted::Fail(err)) => Err(err),
            Some(Scripted::Stall) => futures::future::pending().await,
            None => Err(StreamError::Network("connection refused".into())),
        }
    }
}

/// Server side of a scripted stream. Dropping it ends the stream.
#[derive(Clone)]
pub struct MemoryStreamHandle {
    tx: mpsc::UnboundedSender<Result<Bytes, StreamError>>,
}

impl MemoryStreamHandle {
    /// Send raw text. Returns false once the client dropped the stream.
    pub fn send_raw(&self, text: &str) -> bool {
        self.tx.send(Ok(Bytes::copy_from_slice(text.as_bytes()))).is_ok()
    }

    pub fn send_event(&self, event: &Event) -> bool {
        match encode_event(event) {
            Ok(frame) => self.send_raw(&frame),
            Err(_) => false,
        }
    }

    pub fn send_connected(&self) -> bool {
        self.send_raw(CONNECTED_FRAME)
    }

    pub fn send_heartbeat(&self) -> bool {
        self.send_raw(HEARTBEAT_FRAME)
    }

    /// Break the stream with a transport error.
    pub fn fail(&self, err: StreamError) -> bool {
        self.tx.send(Err(err)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
