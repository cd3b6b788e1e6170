//! # relay-server
//!
//! Axum HTTP + `WebSocket` message relay.
//!
//! - `WebSocket` gateway: peer registry, identity assignment, message dispatch
//! - Fan-out broadcast to every live peer (optionally excluding the sender)
//! - Per-peer keepalive probes bound to the peer's lifetime
//! - HTTP status endpoints reading registry state
//! - Graceful shutdown: notify peers, close with normal closure, bounded drain

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod status;
pub mod websocket;

pub use config::ServerConfig;
pub use errors::RelayError;
pub use server::RelayServer;
