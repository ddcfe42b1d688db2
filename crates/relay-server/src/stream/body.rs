//! Response body for a stream connection.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::connection::{CloseReason, StreamConnection};

/// Outbound frames of one connection, ending when the connection closes.
///
/// Dropping it (the server dropping the response body after the client
/// disconnects) closes the connection.
pub struct FrameStream {
    inner: Pin<Box<dyn Stream<Item = Bytes> + Send>>,
    _guard: DisconnectGuard,
}

impl FrameStream {
    pub(crate) fn new(rx: mpsc::Receiver<Bytes>, conn: Arc<StreamConnection>) -> Self {
        let cancelled = conn.cancellation().clone().cancelled_owned();
        let inner = ReceiverStream::new(rx).take_until(cancelled);
        Self {
            inner: Box::pin(inner),
            _guard: DisconnectGuard { conn },
        }
    }
}

impl Stream for FrameStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx).map(|frame| frame.map(Ok))
    }
}

struct DisconnectGuard {
    conn: Arc<StreamConnection>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let _ = self.conn.close(CloseReason::ClientDisconnected);
    }
}
