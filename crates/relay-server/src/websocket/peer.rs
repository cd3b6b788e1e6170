//! Connected peer state.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

/// Process-unique peer identifier, rendered as `client_<n>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client_{}", self.0)
    }
}

/// Transport liveness of a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    /// Sends are accepted.
    Open,
    /// Closure has started; no further sends.
    Closing,
    /// Removed from the registry.
    Closed,
}

impl Liveness {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Closing => 1,
            Self::Closed => 2,
        }
    }
}

/// Close frame requested for a peer, written after its queued frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseRequest {
    /// `WebSocket` close code.
    pub code: u16,
    /// Human-readable reason.
    pub reason: String,
}

/// Slot shared between a peer and its writer task.
pub type CloseSlot = Arc<Mutex<Option<CloseRequest>>>;

/// Why a send to a peer did not go out.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The peer is closing or closed.
    #[error("peer is not open")]
    NotOpen,
    /// The outbound queue is full.
    #[error("outbound queue full")]
    QueueFull,
    /// The writer task has gone away.
    #[error("outbound channel closed")]
    ChannelClosed,
    /// The envelope could not be serialized.
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Counters shared by the registry and every peer it owns.
#[derive(Debug, Default)]
pub struct RelayCounters {
    /// Peers ever inserted.
    pub total_connected: AtomicU64,
    /// Frames successfully queued to peers.
    pub messages_sent: AtomicU64,
    /// Inbound messages accepted for dispatch.
    pub messages_received: AtomicU64,
}

/// Metadata a peer reports about itself.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PeerMetadata {
    /// From `identification.clientName`.
    pub client_name: Option<String>,
    /// From `identification.clientType`.
    pub client_type: Option<String>,
    /// Last `system_info` payload.
    pub system_info: Option<Value>,
    /// Last `window_info` payload.
    pub window_info: Option<Value>,
}

/// One live connection plus its metadata.
pub struct PeerHandle {
    /// Identity assigned at accept time.
    pub id: PeerId,
    /// Remote socket address.
    pub remote_addr: SocketAddr,
    /// When the peer was registered.
    pub connected_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    liveness: AtomicU8,
    tx: mpsc::Sender<Arc<str>>,
    closing: CancellationToken,
    close_request: CloseSlot,
    keepalive: Mutex<Option<AbortHandle>>,
    metadata: Mutex<PeerMetadata>,
    counters: Arc<RelayCounters>,
}

impl PeerHandle {
    /// Create an open peer.
    pub fn new(
        id: PeerId,
        remote_addr: SocketAddr,
        tx: mpsc::Sender<Arc<str>>,
        counters: Arc<RelayCounters>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            remote_addr,
            connected_at: now,
            last_activity: Mutex::new(now),
            liveness: AtomicU8::new(Liveness::Open.as_u8()),
            tx,
            closing: CancellationToken::new(),
            close_request: Arc::new(Mutex::new(None)),
            keepalive: Mutex::new(None),
            metadata: Mutex::new(PeerMetadata::default()),
            counters,
        }
    }

    /// Current liveness.
    pub fn liveness(&self) -> Liveness {
        Liveness::from_u8(self.liveness.load(Ordering::Acquire))
    }

    /// Whether sends are currently accepted.
    pub fn is_open(&self) -> bool {
        self.liveness() == Liveness::Open
    }

    /// Queue a serialized envelope.
    pub fn send(&self, text: Arc<str>) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::NotOpen);
        }
        match self.tx.try_send(text) {
            Ok(()) => {
                let _ = self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.mark_closing();
                Err(SendError::ChannelClosed)
            }
        }
    }

    /// Start a normal closure and stop accepting sends.
    ///
    /// The close frame does not go through the outbound queue, so a full
    /// queue cannot drop it; the writer sends it after the queued frames.
    /// Returns `false` if the peer was already closing or closed.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        if !self.transition(Liveness::Open, Liveness::Closing) {
            return false;
        }
        *self.close_request.lock() = Some(CloseRequest {
            code,
            reason: reason.to_owned(),
        });
        self.closing.cancel();
        true
    }

    /// Close frame requested by [`close`](Self::close), if any.
    pub fn pending_close(&self) -> Option<CloseRequest> {
        self.close_request.lock().clone()
    }

    /// Slot the writer takes the close frame from.
    pub(crate) fn close_slot(&self) -> CloseSlot {
        self.close_request.clone()
    }

    /// The transport signaled failure; stop accepting sends.
    pub fn mark_closing(&self) {
        if self.transition(Liveness::Open, Liveness::Closing) {
            self.closing.cancel();
        }
    }

    /// Final transition, performed by the registry on removal.
    pub(crate) fn mark_closed(&self) {
        self.liveness.store(Liveness::Closed.as_u8(), Ordering::Release);
        self.closing.cancel();
        if let Some(handle) = self.keepalive.lock().take() {
            handle.abort();
        }
    }

    fn transition(&self, from: Liveness, to: Liveness) -> bool {
        self.liveness
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Resolves once liveness has left `Open`.
    pub async fn closed(&self) {
        self.closing.cancelled().await;
    }

    /// Token cancelled when liveness leaves `Open`.
    pub fn closing_token(&self) -> CancellationToken {
        self.closing.clone()
    }

    /// Bind a keepalive task to this peer. Fails if one is already bound.
    pub(crate) fn attach_keepalive(&self, handle: AbortHandle) -> bool {
        let mut slot = self.keepalive.lock();
        if slot.is_some() || self.liveness() == Liveness::Closed {
            return false;
        }
        *slot = Some(handle);
        true
    }

    /// Whether a keepalive task is bound.
    pub fn has_keepalive(&self) -> bool {
        self.keepalive.lock().is_some()
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        *self.last_activity.lock() = Utc::now();
    }

    /// Time of the last inbound message (or registration).
    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }

    /// Snapshot of reported metadata.
    pub fn metadata(&self) -> PeerMetadata {
        self.metadata.lock().clone()
    }

    /// Mutate reported metadata.
    pub fn update_metadata(&self, f: impl FnOnce(&mut PeerMetadata)) {
        f(&mut self.metadata.lock());
    }
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        self.closing.cancel();
        if let Some(handle) = self.keepalive.get_mut().take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("liveness", &self.liveness())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_peer(capacity: usize) -> (PeerHandle, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let peer = PeerHandle::new(PeerId(1), addr, tx, Arc::new(RelayCounters::default()));
        (peer, rx)
    }

    #[test]
    fn id_display() {
        assert_eq!(PeerId(42).to_string(), "client_42");
    }

    #[test]
    fn new_peer_is_open() {
        let (peer, _rx) = make_peer(8);
        assert_eq!(peer.liveness(), Liveness::Open);
        assert_eq!(peer.connected_at, peer.last_activity());
        assert!(!peer.has_keepalive());
    }

    #[tokio::test]
    async fn send_queues_text_and_counts() {
        let (peer, mut rx) = make_peer(8);
        peer.send(Arc::from("hello")).unwrap();
        assert_eq!(rx.recv().await, Some(Arc::from("hello")));
        assert_eq!(peer.counters.messages_sent.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn send_to_full_queue_fails() {
        let (peer, _rx) = make_peer(1);
        assert!(peer.send(Arc::from("one")).is_ok());
        assert_eq!(peer.send(Arc::from("two")), Err(SendError::QueueFull));
        assert!(peer.is_open());
    }

    #[test]
    fn send_to_dropped_writer_marks_closing() {
        let (peer, rx) = make_peer(4);
        drop(rx);
        assert_eq!(peer.send(Arc::from("x")), Err(SendError::ChannelClosed));
        assert_eq!(peer.liveness(), Liveness::Closing);
        assert!(peer.closing_token().is_cancelled());
    }

    #[test]
    fn close_records_request_once() {
        let (peer, mut rx) = make_peer(4);
        assert!(peer.close(1000, "bye"));
        assert!(!peer.close(1001, "again"));
        assert_eq!(peer.liveness(), Liveness::Closing);
        assert_eq!(
            peer.pending_close(),
            Some(CloseRequest {
                code: 1000,
                reason: "bye".into()
            })
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(peer.send(Arc::from("late")), Err(SendError::NotOpen));
    }

    #[test]
    fn close_with_full_queue_keeps_close_request() {
        let (peer, mut rx) = make_peer(1);
        peer.send(Arc::from("pending")).unwrap();
        assert!(peer.close(1000, "server shutdown"));
        assert_eq!(peer.liveness(), Liveness::Closing);
        assert_eq!(peer.pending_close().map(|c| c.code), Some(1000));
        assert_eq!(rx.try_recv().unwrap(), Arc::from("pending"));
    }

    #[tokio::test]
    async fn closed_future_resolves_after_close() {
        let (peer, _rx) = make_peer(4);
        let _ = peer.close(1000, "done");
        peer.closed().await;
    }

    #[tokio::test]
    async fn mark_closed_aborts_keepalive() {
        let (peer, _rx) = make_peer(4);
        let task = tokio::spawn(std::future::pending::<()>());
        assert!(peer.attach_keepalive(task.abort_handle()));
        assert!(peer.has_keepalive());
        peer.mark_closed();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(peer.liveness(), Liveness::Closed);
    }

    #[tokio::test]
    async fn second_keepalive_rejected() {
        let (peer, _rx) = make_peer(4);
        let first = tokio::spawn(std::future::pending::<()>());
        let second = tokio::spawn(std::future::pending::<()>());
        assert!(peer.attach_keepalive(first.abort_handle()));
        assert!(!peer.attach_keepalive(second.abort_handle()));
        second.abort();
    }

    #[test]
    fn metadata_updates() {
        let (peer, _rx) = make_peer(4);
        peer.update_metadata(|m| m.client_name = Some("TestClient".into()));
        assert_eq!(peer.metadata().client_name.as_deref(), Some("TestClient"));
    }
}
