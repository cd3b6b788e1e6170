//! Registry of connected peers.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::peer::{PeerHandle, PeerId, RelayCounters};
use crate::status::{PeerStatus, StatusSnapshot};

/// Owns every live [`PeerHandle`], keyed by id.
///
/// Ids are monotonic, so iteration over the map is insertion order. Every
/// operation is a single critical section and no lock is held across an
/// `.await`. Once [`close_all`](Self::close_all) has run, no new peer is
/// admitted.
pub struct PeerRegistry {
    peers: RwLock<BTreeMap<PeerId, Arc<PeerHandle>>>,
    closing: AtomicBool,
    next_id: AtomicU64,
    counters: Arc<RelayCounters>,
    size_tx: watch::Sender<usize>,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (size_tx, _) = watch::channel(0);
        Self {
            peers: RwLock::new(BTreeMap::new()),
            closing: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            counters: Arc::new(RelayCounters::default()),
            size_tx,
        }
    }

    /// Register a peer around its outbound channel and return its fresh id.
    ///
    /// Returns `None` once the registry is closing.
    pub fn insert(&self, tx: mpsc::Sender<Arc<str>>, remote_addr: SocketAddr) -> Option<PeerId> {
        self.admit(tx, remote_addr, |_| {}).map(|peer| peer.id)
    }

    /// Register a peer, running `greet` before any other task can see it.
    ///
    /// Whatever `greet` queues is ahead of every broadcast the peer receives.
    /// `greet` runs under the registry lock and must not call back into the
    /// registry. Returns `None` once the registry is closing.
    pub fn admit(
        &self,
        tx: mpsc::Sender<Arc<str>>,
        remote_addr: SocketAddr,
        greet: impl FnOnce(&PeerHandle),
    ) -> Option<Arc<PeerHandle>> {
        let mut peers = self.peers.write();
        if self.closing.load(Ordering::Acquire) {
            drop(peers);
            debug!(%remote_addr, "registry closing, peer refused");
            return None;
        }
        let id = PeerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let peer = Arc::new(PeerHandle::new(id, remote_addr, tx, self.counters.clone()));
        greet(&peer);
        let _ = peers.insert(id, peer.clone());
        let _ = self.counters.total_connected.fetch_add(1, Ordering::Relaxed);
        let _ = self.size_tx.send_replace(peers.len());
        drop(peers);
        debug!(peer_id = %id, %remote_addr, "peer registered");
        Some(peer)
    }

    /// Remove a peer, marking it closed. Absent ids are a no-op.
    pub fn remove(&self, id: PeerId) -> Option<Arc<PeerHandle>> {
        let mut peers = self.peers.write();
        let removed = peers.remove(&id)?;
        removed.mark_closed();
        let _ = self.size_tx.send_replace(peers.len());
        drop(peers);
        debug!(peer_id = %id, "peer removed");
        Some(removed)
    }

    /// Look up a peer.
    pub fn get(&self, id: PeerId) -> Option<Arc<PeerHandle>> {
        self.peers.read().get(&id).cloned()
    }

    /// Snapshot of current peers in insertion order.
    pub fn snapshot(&self) -> Vec<Arc<PeerHandle>> {
        self.peers.read().values().cloned().collect()
    }

    /// Visit every peer present when the call started.
    ///
    /// The visitor runs outside the lock, so it may remove or close peers.
    pub fn for_each(&self, mut visitor: impl FnMut(&Arc<PeerHandle>)) {
        for peer in self.snapshot() {
            visitor(&peer);
        }
    }

    /// Number of registered peers.
    pub fn size(&self) -> usize {
        self.peers.read().len()
    }

    /// Whether no peers are registered.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Stop admitting peers and initiate closure of every open one.
    /// Returns how many were closed.
    pub fn close_all(&self, code: u16, reason: &str) -> usize {
        let peers: Vec<Arc<PeerHandle>> = {
            let peers = self.peers.write();
            self.closing.store(true, Ordering::Release);
            peers.values().cloned().collect()
        };
        peers.iter().filter(|peer| peer.close(code, reason)).count()
    }

    /// Whether [`close_all`](Self::close_all) has run.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Remove every peer. Used when the shutdown drain times out.
    pub fn remove_all(&self) -> usize {
        let ids: Vec<PeerId> = self.peers.read().keys().copied().collect();
        ids.into_iter().filter(|id| self.remove(*id).is_some()).count()
    }

    /// Wait until the registry is empty or `timeout` elapses.
    ///
    /// Returns `true` if the registry drained in time.
    pub async fn wait_empty(&self, timeout: Duration) -> bool {
        let mut rx = self.size_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// Record an inbound message accepted for dispatch.
    pub fn record_received(&self) {
        let _ = self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Shared counters.
    pub fn counters(&self) -> &RelayCounters {
        &self.counters
    }

    /// Read-only status for collaborators. Counters are best-effort.
    pub fn status(&self, started: Instant) -> StatusSnapshot {
        let peers: Vec<PeerStatus> = self
            .snapshot()
            .iter()
            .map(|p| PeerStatus {
                id: p.id.to_string(),
                remote_address: p.remote_addr.to_string(),
                connected_at: p.connected_at,
                last_activity: p.last_activity(),
                client_name: p.metadata().client_name,
            })
            .collect();
        StatusSnapshot {
            currently_connected: peers.len(),
            total_ever_connected: self.counters.total_connected.load(Ordering::Relaxed),
            messages_sent: self.counters.messages_sent.load(Ordering::Relaxed),
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            uptime_seconds: started.elapsed().as_secs(),
            peers,
        }
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
