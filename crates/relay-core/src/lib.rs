//! # relay-core
//!
//! Shared building blocks for real-time update propagation:
//!
//! - [`events`]: the `{type, payload}` event model, the published event
//!   catalog and consumer-side filters
//! - [`bus`]: the process-wide publish/subscribe registry
//! - [`frame`]: the text wire format (data frames, comment frames) and an
//!   incremental decoder
//! - [`ids`]: prefixed identifiers for connections and subscriptions

#![deny(unsafe_code)]

pub mod bus;
pub mod errors;
pub mod events;
pub mod frame;
pub mod ids;

pub use bus::{EventBus, Subscription};
pub use errors::FrameError;
pub use events::{Event, EventFilter, EventKind};
pub use frame::{Frame, FrameDecoder};
