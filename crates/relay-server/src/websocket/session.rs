//! Per-peer session: registration, writer task, inbound loop, and cleanup.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes};
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::broadcast::{broadcast, send_to};
use super::codec::ServerMessage;
use super::dispatch::handle_message;
use super::keepalive::arm_keepalive;
use super::peer::{PeerHandle, PeerId};
use super::{SHUTDOWN_REASON, close_code};
use super::registry::PeerRegistry;
use crate::config::ServerConfig;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};

/// How long cleanup waits for the writer to flush queued frames.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Knobs for one peer session.
#[derive(Clone, Debug)]
pub struct SessionSettings {
    /// Period of `server_ping` probes.
    pub keepalive_interval: Duration,
    /// Largest inbound payload accepted, in bytes.
    pub max_message_size: usize,
    /// Outbound queue depth per peer.
    pub send_queue_capacity: usize,
    /// Broadcast join/leave notices to other peers.
    pub announce_presence: bool,
}

impl From<&ServerConfig> for SessionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            keepalive_interval: config.keepalive_interval(),
            max_message_size: config.max_message_size,
            send_queue_capacity: config.send_queue_capacity.max(1),
            announce_presence: config.announce_presence,
        }
    }
}

/// Drive one peer from registration to removal. Returns the peer's id, or
/// `None` if the registry was already closing and the peer was turned away
/// with a normal closure.
///
/// `sink` and `stream` are the two halves of the transport. The session
/// ends when the peer closes, the transport fails, or the peer is closed
/// from elsewhere (shutdown, write failure).
#[instrument(skip_all, fields(remote_addr = %remote_addr))]
pub async fn run_peer_session<W, R, E>(
    mut sink: W,
    mut stream: R,
    remote_addr: SocketAddr,
    registry: Arc<PeerRegistry>,
    settings: SessionSettings,
) -> Option<PeerId>
where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: fmt::Display,
    R: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: fmt::Display + Send,
{
    let (tx, rx) = mpsc::channel(settings.send_queue_capacity.max(1));
    let admitted = registry.admit(tx, remote_addr, |peer| {
        if let Err(e) = send_to(peer, &ServerMessage::welcome(peer.id)) {
            warn!(peer_id = %peer.id, error = %e, "welcome not sent");
        }
    });
    let Some(peer) = admitted else {
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: Utf8Bytes::from_static(SHUTDOWN_REASON),
        };
        let _ = sink.send(Message::Close(Some(frame))).await;
        let _ = sink.close().await;
        return None;
    };
    let id = peer.id;

    let started = Instant::now();
    info!(peer_id = %id, "peer connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let writer = tokio::spawn(run_writer(sink, rx, Arc::downgrade(&peer)));
    let _ = arm_keepalive(&peer, settings.keepalive_interval);
    if settings.announce_presence {
        let _ = broadcast(
            &registry,
            &ServerMessage::broadcast(format!("{id} connected"), "server"),
            Some(id),
        );
    }

    let reason = read_loop(&mut stream, &peer, &registry, settings.max_message_size).await;
    drop(stream);

    let removed = registry.remove(id).is_some();
    drop(peer);
    if settings.announce_presence && removed {
        let _ = broadcast(
            &registry,
            &ServerMessage::broadcast(format!("{id} disconnected"), "server"),
            None,
        );
    }

    let abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!(peer_id = %id, "writer did not drain in time");
        abort.abort();
    }

    info!(peer_id = %id, reason, "peer disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    Some(id)
}

async fn read_loop<R, E>(
    stream: &mut R,
    peer: &PeerHandle,
    registry: &PeerRegistry,
    max_message_size: usize,
) -> &'static str
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    loop {
        tokio::select! {
            () = peer.closed() => return "closed by server",
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = handle_message(text.as_str().as_bytes(), peer, registry, max_message_size);
                }
                Some(Ok(Message::Binary(data))) => {
                    let _ = handle_message(&data, peer, registry, max_message_size);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    if let Some(f) = frame {
                        debug!(peer_id = %peer.id, code = u16::from(f.code), reason = f.reason.as_str(), "close frame received");
                    }
                    return "closed by peer";
                }
                Some(Err(e)) => {
                    warn!(peer_id = %peer.id, error = %e, "transport error");
                    return "transport error";
                }
                None => return "stream ended",
            },
        }
    }
}

/// Forward queued frames to the transport until the peer closes.
///
/// Frames already queued when the peer starts closing are still written,
/// then the requested close frame, so a shutdown notice and the close code
/// arrive in order even when the queue was full.
async fn run_writer<W>(mut sink: W, mut rx: mpsc::Receiver<Arc<str>>, peer: Weak<PeerHandle>)
where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display,
{
    let Some((token, close_slot)) = peer
        .upgrade()
        .map(|p| (p.closing_token(), p.close_slot()))
    else {
        return;
    };
    loop {
        let text = tokio::select! {
            biased;
            text = rx.recv() => text,
            () = token.cancelled() => None,
        };
        let Some(text) = text else { break };
        if let Err(e) = sink.send(Message::Text(text.to_string().into())).await {
            debug!(error = %e, "transport write failed");
            if let Some(peer) = peer.upgrade() {
                peer.mark_closing();
            }
            return;
        }
    }
    let request = close_slot.lock().take();
    if let Some(request) = request {
        let frame = CloseFrame {
            code: request.code,
            reason: request.reason.into(),
        };
        let _ = sink.send(Message::Close(Some(frame))).await;
    }
    let _ = sink.close().await;
}
