//! Long-lived event stream connections.

pub mod body;
pub mod connection;
pub mod heartbeat;

pub use body::FrameStream;
pub use connection::{CloseReason, StreamConnection, WriteOutcome};
pub use heartbeat::HeartbeatResult;
