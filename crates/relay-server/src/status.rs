//! Read-only status views served over HTTP.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Name reported in `welcome` envelopes and the `/` endpoint.
pub const SERVER_NAME: &str = "relay WebSocket server";

/// Crate version reported alongside [`SERVER_NAME`].
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Registry snapshot exposed to collaborators.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    /// Peers registered right now.
    pub currently_connected: usize,
    /// Peers ever registered.
    pub total_ever_connected: u64,
    /// Frames queued to peers.
    pub messages_sent: u64,
    /// Inbound messages dispatched.
    pub messages_received: u64,
    /// Seconds since the server started.
    pub uptime_seconds: u64,
    /// One entry per registered peer, in connection order.
    pub peers: Vec<PeerStatus>,
}

/// Per-peer entry of a [`StatusSnapshot`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    /// Peer id (`client_<n>`).
    pub id: String,
    /// Remote socket address.
    pub remote_address: String,
    /// Registration time.
    pub connected_at: DateTime<Utc>,
    /// Last inbound message.
    pub last_activity: DateTime<Utc>,
    /// Name from the peer's `identification`, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
}

/// `GET /` body.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfoResponse {
    /// Server name.
    pub name: &'static str,
    /// Server version.
    pub version: &'static str,
    /// Lifecycle state, lowercase.
    pub status: String,
    /// Bound port.
    pub port: u16,
    /// `WebSocket` endpoint path.
    pub path: String,
    /// Registry counters.
    pub stats: StatusSnapshot,
}

/// `GET /health` body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Current peer count.
    pub connections: usize,
}

/// Build a health response from live counters.
pub fn health_check(uptime_secs: u64, connections: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs,
        connections,
    }
}
