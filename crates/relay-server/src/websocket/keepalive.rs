//! Periodic application-level probes to each peer.

use std::sync::{Arc, Weak};
use std::time::Duration;

use metrics::counter;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use super::broadcast::send_to;
use super::codec::ServerMessage;
use super::peer::{PeerHandle, SendError};
use crate::metrics::KEEPALIVE_PROBES_TOTAL;

/// Why the keepalive loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepaliveResult {
    /// The peer stopped accepting sends or was dropped.
    PeerGone,
    /// The peer's closing token fired.
    Cancelled,
}

/// Send a `server_ping` to the peer every `interval`, first tick one
/// interval after start.
///
/// Holds only a weak reference so a dropped peer ends the loop.
pub async fn run_keepalive(
    peer: Weak<PeerHandle>,
    cancel: CancellationToken,
    interval: Duration,
) -> KeepaliveResult {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return KeepaliveResult::Cancelled,
            _ = ticker.tick() => {
                let Some(peer) = peer.upgrade() else {
                    return KeepaliveResult::PeerGone;
                };
                if !peer.is_open() {
                    return KeepaliveResult::PeerGone;
                }
                match send_to(&peer, &ServerMessage::server_ping(peer.id)) {
                    Ok(()) => {
                        counter!(KEEPALIVE_PROBES_TOTAL).increment(1);
                        trace!(peer_id = %peer.id, "keepalive probe sent");
                    }
                    Err(SendError::NotOpen | SendError::ChannelClosed) => {
                        return KeepaliveResult::PeerGone;
                    }
                    Err(e) => warn!(peer_id = %peer.id, error = %e, "keepalive probe dropped"),
                }
            }
        }
    }
}

/// Spawn the keepalive task for `peer` and bind it to the peer's lifetime.
///
/// Returns `false` (spawning nothing) if the peer is not open or already
/// has one.
pub fn arm_keepalive(peer: &Arc<PeerHandle>, interval: Duration) -> bool {
    if !peer.is_open() || peer.has_keepalive() {
        return false;
    }
    let task = tokio::spawn(run_keepalive(
        Arc::downgrade(peer),
        peer.closing_token(),
        interval,
    ));
    if peer.attach_keepalive(task.abort_handle()) {
        true
    } else {
        task.abort();
        false
    }
}
