//! Envelope fan-out to connected peers.

use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};

use super::codec::{self, ServerMessage};
use super::peer::{PeerHandle, PeerId, SendError};
use super::registry::PeerRegistry;
use crate::metrics::BROADCAST_DROPS_TOTAL;

/// Per-call delivery tally.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Peers the envelope was queued to.
    pub delivered: usize,
    /// Peers skipped because they were not open.
    pub skipped: usize,
    /// Peers whose send failed.
    pub failed: usize,
}

/// Serialize `message` once and queue it to every open peer except `exclude`.
///
/// A failing peer never prevents delivery to the others.
pub fn broadcast(
    registry: &PeerRegistry,
    message: &ServerMessage,
    exclude: Option<PeerId>,
) -> BroadcastReport {
    let mut report = BroadcastReport::default();
    let json: Arc<str> = match codec::serialize(message) {
        Ok(j) => Arc::from(j),
        Err(e) => {
            warn!(kind = message.tag(), error = %e, "failed to serialize broadcast");
            return report;
        }
    };

    registry.for_each(|peer| {
        if Some(peer.id) == exclude {
            return;
        }
        if !peer.is_open() {
            report.skipped += 1;
            return;
        }
        match peer.send(Arc::clone(&json)) {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                report.failed += 1;
                counter!(BROADCAST_DROPS_TOTAL).increment(1);
                warn!(peer_id = %peer.id, error = %e, "failed to deliver broadcast");
            }
        }
    });

    debug!(
        kind = message.tag(),
        recipients = report.delivered,
        skipped = report.skipped,
        failed = report.failed,
        "broadcast sent"
    );
    report
}

/// Serialize `message` and queue it to a single peer.
pub fn send_to(peer: &PeerHandle, message: &ServerMessage) -> Result<(), SendError> {
    let json = codec::serialize(message).map_err(|e| SendError::Encode(e.to_string()))?;
    peer.send(Arc::from(json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    fn insert(reg: &PeerRegistry, capacity: usize) -> (PeerId, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let addr = SocketAddr::from(([127, 0, 0, 1], 7000));
        (reg.insert(tx, addr).unwrap(), rx)
    }

    fn text(frame: Arc<str>) -> serde_json::Value {
        serde_json::from_str(&frame).unwrap()
    }

    #[test]
    fn delivers_to_all_but_excluded() {
        let reg = PeerRegistry::new();
        let (a, mut ra) = insert(&reg, 8);
        let (_b, mut rb) = insert(&reg, 8);
        let (_c, mut rc) = insert(&reg, 8);

        let report = broadcast(&reg, &ServerMessage::broadcast("client_1: hi", "client_1"), Some(a));
        assert_eq!(report.delivered, 2);
        assert!(ra.try_recv().is_err());
        for rx in [&mut rb, &mut rc] {
            let msg = text(rx.try_recv().unwrap());
            assert_eq!(msg["type"], "broadcast");
            assert_eq!(msg["message"], "client_1: hi");
            assert_eq!(msg["from"], "client_1");
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn empty_registry_is_noop() {
        let reg = PeerRegistry::new();
        let report = broadcast(&reg, &ServerMessage::broadcast("x", "server"), None);
        assert_eq!(report, BroadcastReport::default());
    }

    #[test]
    fn only_sender_connected_delivers_nothing() {
        let reg = PeerRegistry::new();
        let (a, mut ra) = insert(&reg, 8);
        let report = broadcast(&reg, &ServerMessage::broadcast("x", "client_1"), Some(a));
        assert_eq!(report.delivered, 0);
        assert!(ra.try_recv().is_err());
    }

    #[test]
    fn closing_peers_are_skipped() {
        let reg = PeerRegistry::new();
        let (a, _ra) = insert(&reg, 8);
        let (_b, mut rb) = insert(&reg, 8);
        reg.get(a).unwrap().mark_closing();

        let report = broadcast(&reg, &ServerMessage::broadcast("x", "server"), None);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.delivered, 1);
        assert!(rb.try_recv().is_ok());
    }

    #[test]
    fn failing_peer_does_not_block_others() {
        let reg = PeerRegistry::new();
        let (_a, ra) = insert(&reg, 8);
        let (_b, mut rb) = insert(&reg, 1);
        let (_c, mut rc) = insert(&reg, 8);
        drop(ra);
        // Fill b's queue so the next send overflows
        reg.get(PeerId(2)).unwrap().send(Arc::from("filler")).unwrap();

        let report = broadcast(&reg, &ServerMessage::broadcast("x", "server"), None);
        assert_eq!(report.failed, 2);
        assert_eq!(report.delivered, 1);
        assert!(rc.try_recv().is_ok());
        assert_eq!(rb.try_recv().unwrap(), Arc::from("filler"));
    }

    #[test]
    fn send_to_single_peer() {
        let reg = PeerRegistry::new();
        let (a, mut ra) = insert(&reg, 8);
        let peer = reg.get(a).unwrap();
        send_to(&peer, &ServerMessage::welcome(a)).unwrap();
        assert_eq!(text(ra.try_recv().unwrap())["clientId"], "client_1");
    }

    #[test]
    fn send_to_closed_peer_fails() {
        let reg = PeerRegistry::new();
        let (a, _ra) = insert(&reg, 8);
        let peer = reg.remove(a).unwrap();
        assert_eq!(
            send_to(&peer, &ServerMessage::welcome(a)),
            Err(SendError::NotOpen)
        );
    }
}
