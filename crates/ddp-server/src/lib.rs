//! # ddp-server
//!
//! Axum `WebSocket` server speaking DDP.
//!
//! - Handshake, ping/pong heartbeat and frame dispatch per connection
//! - Method invocation with one `result` and one `updated` per call
//! - Subscriptions merging cursor snapshots and live changes onto the socket
//! - Settings file + `DDP_*` environment configuration, structured logging,
//!   Prometheus metrics and a health endpoint
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod loader;
pub mod logging;
pub mod metrics;
pub mod rpc;
pub mod server;
pub mod shutdown;
pub mod subscription;
pub mod websocket;

pub use config::{LogFormat, ServerConfig};
pub use errors::{ConfigError, RegistryError, ServerError};
pub use rpc::registry::{
    Method, MethodOutcome, PendingResult, Publication, Registry, async_method, publication,
    sync_method,
};
pub use server::{DdpServer, ServerHandle};
pub use shutdown::ShutdownCoordinator;
