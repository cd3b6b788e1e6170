//! `WebSocket` peer management, message routing, and fan-out.

pub mod broadcast;
pub mod codec;
pub mod dispatch;
pub mod keepalive;
pub mod peer;
pub mod registry;
pub mod session;

pub use peer::{Liveness, PeerHandle, PeerId};
pub use registry::PeerRegistry;

/// Reason sent with close frames during shutdown.
pub const SHUTDOWN_REASON: &str = "server shutdown";

/// `WebSocket` close codes used by the relay.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
}
