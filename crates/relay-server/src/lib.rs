//! # relay-server
//!
//! HTTP side of update propagation: authenticated callers open a long-lived
//! `GET /api/events` stream that receives every bus event as a `data:`
//! frame, with `: heartbeat` comments keeping intermediaries from timing
//! the connection out.
//!
//! - [`stream`]: one connection (subscription, heartbeat, idempotent teardown)
//! - [`server`]: routes, shared state and the running server handle
//! - [`registry`]: live connections for health reporting and shutdown
//! - [`shutdown`]: closes every stream, then stops the listener
//! - [`auth`]: bearer-token authentication

#![deny(unsafe_code)]

pub mod auth;
pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod stream;

pub use auth::{Authenticator, Identity, StaticTokenAuthenticator};
pub use config::{ConnectionConfig, ServerConfig};
pub use errors::ServerError;
pub use registry::ConnectionRegistry;
pub use server::{AppState, PublishResponse, RelayServer, ServerHandle, EVENTS_PATH};
pub use health::{HealthResponse, HealthStatus};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
pub use stream::{CloseReason, StreamConnection};
