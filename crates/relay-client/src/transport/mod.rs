//! How the client reaches a stream endpoint.
//!
//! A transport performs one connect and hands back the raw byte stream; the
//! client owns decoding, reconnects and handler dispatch.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::errors::StreamError;

mod http;
mod memory;

pub use http::HttpTransport;
pub use memory::{MemoryStreamHandle, MemoryTransport};

/// Raw chunks of an open stream. Ends when the server closes it.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StreamError>> + Send>>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open one stream. Errors here count as a failed connection attempt.
    async fn connect(&self) -> Result<ByteStream, StreamError>;
}
