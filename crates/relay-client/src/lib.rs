//! # relay-client
//!
//! Consumer side of the relay:
//!
//! - [`client`]: a stream consumer that reconnects with exponential backoff
//!   and exposes its lifecycle and decoded events
//! - [`coordinator`]: keyed request de-duplication with a short result cache
//! - [`live`]: values refreshed by matching events, polled while the stream
//!   is down
//! - [`transport`]: HTTP and in-memory stream transports

#![deny(unsafe_code)]

pub mod backoff;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod live;
pub mod transport;

pub use backoff::Backoff;
pub use client::{ClientState, StreamClient, StreamClientBuilder};
pub use config::{CoordinatorConfig, StreamClientConfig};
pub use coordinator::RequestCoordinator;
pub use errors::StreamError;
pub use live::{LiveResource, LiveResourceConfig};
pub use transport::{HttpTransport, MemoryTransport, Transport};
