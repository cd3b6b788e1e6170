//! Routing of inbound envelopes to replies, echoes, broadcasts, or logs.

use metrics::counter;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::broadcast::{broadcast, send_to};
use super::codec::{self, Envelope, MessageKind, ServerMessage};
use super::peer::{PeerHandle, PeerId};
use super::registry::PeerRegistry;
use crate::metrics::{MESSAGES_RECEIVED_TOTAL, MESSAGES_REJECTED_TOTAL};

/// Informational payloads that are recorded and never answered.
#[derive(Clone, Debug, PartialEq)]
pub enum Report {
    /// `system_info` body (`data` field, or the whole payload).
    SystemInfo(Value),
    /// `window_info` payload.
    WindowInfo(Value),
    /// `identification` fields.
    Identification {
        /// `clientName`, if present.
        name: Option<String>,
        /// `clientType`, if present.
        client_type: Option<String>,
    },
}

/// What the relay does with one inbound envelope.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Answer the sender.
    Reply(ServerMessage),
    /// Send the envelope back to the sender, wrapped.
    Echo(ServerMessage),
    /// Fan out to every other open peer.
    Broadcast(ServerMessage),
    /// Record and stay silent.
    Log(Report),
}

impl Action {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Reply(_) => "reply",
            Self::Echo(_) => "echo",
            Self::Broadcast(_) => "broadcast",
            Self::Log(_) => "log",
        }
    }
}

/// Result of [`handle_message`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handled {
    /// Routed; carries the action label.
    Dispatched(&'static str),
    /// Dropped before parsing because it exceeded the size limit.
    Rejected,
}

/// Decide the action for `envelope` sent by `sender`. Pure.
pub fn route(envelope: &Envelope, sender: PeerId) -> Action {
    match &envelope.kind {
        MessageKind::Ping => Action::Reply(ServerMessage::Pong {
            original_timestamp: envelope.timestamp.clone(),
        }),
        MessageKind::SystemInfo => {
            let body = envelope
                .field("data")
                .cloned()
                .unwrap_or_else(|| Value::Object(envelope.fields.clone()));
            Action::Log(Report::SystemInfo(body))
        }
        MessageKind::WindowInfo => {
            Action::Log(Report::WindowInfo(Value::Object(envelope.fields.clone())))
        }
        MessageKind::Identification => Action::Log(Report::Identification {
            name: envelope.field_str("clientName").map(str::to_owned),
            client_type: envelope.field_str("clientType").map(str::to_owned),
        }),
        MessageKind::Broadcast => {
            let text = match envelope.field("message") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            Action::Broadcast(ServerMessage::broadcast(
                format!("{sender}: {text}"),
                sender.to_string(),
            ))
        }
        MessageKind::Text | MessageKind::Other(_) | MessageKind::Untyped => {
            Action::Echo(ServerMessage::echo(envelope))
        }
    }
}

/// Process one raw inbound payload from `peer`.
///
/// Payloads longer than `max_message_size` bytes are answered with an
/// `error` envelope and never parsed.
pub fn handle_message(
    raw: &[u8],
    peer: &PeerHandle,
    registry: &PeerRegistry,
    max_message_size: usize,
) -> Handled {
    if raw.len() > max_message_size {
        counter!(MESSAGES_REJECTED_TOTAL).increment(1);
        warn!(peer_id = %peer.id, size = raw.len(), limit = max_message_size, "oversized message rejected");
        let reply = ServerMessage::Error {
            message: "message rejected".into(),
            error: format!("message of {} bytes exceeds limit of {max_message_size}", raw.len()),
        };
        if let Err(e) = send_to(peer, &reply) {
            debug!(peer_id = %peer.id, error = %e, "error reply not sent");
        }
        return Handled::Rejected;
    }

    peer.touch();
    registry.record_received();
    let envelope = codec::parse(raw);
    counter!(MESSAGES_RECEIVED_TOTAL, "type" => envelope.kind.label()).increment(1);
    debug!(peer_id = %peer.id, kind = envelope.kind.label(), "message received");

    let action = route(&envelope, peer.id);
    let label = action.label();
    execute(action, peer, registry);
    Handled::Dispatched(label)
}

fn execute(action: Action, peer: &PeerHandle, registry: &PeerRegistry) {
    match action {
        Action::Reply(message) | Action::Echo(message) => {
            if let Err(e) = send_to(peer, &message) {
                warn!(peer_id = %peer.id, kind = message.tag(), error = %e, "reply not sent");
            }
        }
        Action::Broadcast(message) => {
            let report = broadcast(registry, &message, Some(peer.id));
            info!(peer_id = %peer.id, recipients = report.delivered, "relayed broadcast");
        }
        Action::Log(Report::SystemInfo(body)) => {
            info!(peer_id = %peer.id, system_info = %body, "system info");
            peer.update_metadata(|m| m.system_info = Some(body));
        }
        Action::Log(Report::WindowInfo(body)) => {
            let title = body.get("windowTitle").and_then(Value::as_str).unwrap_or("");
            let process = body.get("processName").and_then(Value::as_str).unwrap_or("");
            info!(peer_id = %peer.id, window_title = title, process_name = process, "window info");
            peer.update_metadata(|m| m.window_info = Some(body));
        }
        Action::Log(Report::Identification { name, client_type }) => {
            info!(
                peer_id = %peer.id,
                client_name = name.as_deref().unwrap_or(""),
                client_type = client_type.as_deref().unwrap_or(""),
                "peer identified"
            );
            peer.update_metadata(|m| {
                m.client_name = name;
                m.client_type = client_type;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use tokio::sync::mpsc;

    const LIMIT: usize = 1024;

    fn insert(reg: &PeerRegistry) -> (PeerId, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(16);
        (reg.insert(tx, SocketAddr::from(([127, 0, 0, 1], 9000))).unwrap(), rx)
    }

    fn next_json(rx: &mut mpsc::Receiver<Arc<str>>) -> Value {
        serde_json::from_str(&rx.try_recv().unwrap()).unwrap()
    }

    #[test]
    fn route_ping_to_pong() {
        let env = codec::parse(br#"{"type":"ping","timestamp":"T0"}"#);
        assert_eq!(
            route(&env, PeerId(1)),
            Action::Reply(ServerMessage::Pong {
                original_timestamp: Some("T0".into())
            })
        );
    }

    #[test]
    fn route_broadcast_prefixes_sender() {
        let env = codec::parse(br#"{"type":"broadcast","message":"hi"}"#);
        assert_eq!(
            route(&env, PeerId(4)),
            Action::Broadcast(ServerMessage::broadcast("client_4: hi", "client_4"))
        );
    }

    #[test]
    fn route_broadcast_without_message() {
        let env = codec::parse(br#"{"type":"broadcast"}"#);
        assert_eq!(
            route(&env, PeerId(1)),
            Action::Broadcast(ServerMessage::broadcast("client_1: ", "client_1"))
        );
    }

    #[test]
    fn route_informational_types_are_silent() {
        for raw in [
            r#"{"type":"system_info","data":{"os":"linux"}}"#,
            r#"{"type":"window_info","windowTitle":"t"}"#,
            r#"{"type":"identification","clientName":"c"}"#,
        ] {
            let action = route(&codec::parse(raw.as_bytes()), PeerId(1));
            assert_eq!(action.label(), "log", "input {raw}");
        }
    }

    #[test]
    fn route_system_info_uses_data_field() {
        let env = codec::parse(br#"{"type":"system_info","data":{"os":"linux"}}"#);
        assert_eq!(
            route(&env, PeerId(1)),
            Action::Log(Report::SystemInfo(json!({"os": "linux"})))
        );
    }

    #[test]
    fn route_everything_else_echoes() {
        for raw in ["hello", r#"{"type":"pong"}"#, r#"{"no_type":1}"#, r#"{"type":"text","content":"x"}"#] {
            let action = route(&codec::parse(raw.as_bytes()), PeerId(1));
            assert_eq!(action.label(), "echo", "input {raw}");
        }
    }

    #[test]
    fn ping_replies_with_original_timestamp() {
        let reg = PeerRegistry::new();
        let (a, mut ra) = insert(&reg);
        let peer = reg.get(a).unwrap();
        let handled = handle_message(br#"{"type":"ping","timestamp":"T0"}"#, &peer, &reg, LIMIT);
        assert_eq!(handled, Handled::Dispatched("reply"));
        let pong = next_json(&mut ra);
        assert_eq!(pong["type"], "pong");
        assert_eq!(pong["originalTimestamp"], "T0");
        assert!(ra.try_recv().is_err());
    }

    #[test]
    fn plain_text_is_echoed() {
        let reg = PeerRegistry::new();
        let (a, mut ra) = insert(&reg);
        let peer = reg.get(a).unwrap();
        let _ = handle_message(b"hello", &peer, &reg, LIMIT);
        let echo = next_json(&mut ra);
        assert_eq!(echo["type"], "echo");
        assert_eq!(echo["originalMessage"], json!({"type": "text", "content": "hello"}));
    }

    #[test]
    fn broadcast_skips_sender() {
        let reg = PeerRegistry::new();
        let (a, mut ra) = insert(&reg);
        let (_b, mut rb) = insert(&reg);
        let peer = reg.get(a).unwrap();
        let _ = handle_message(br#"{"type":"broadcast","message":"hi"}"#, &peer, &reg, LIMIT);
        assert!(ra.try_recv().is_err());
        let msg = next_json(&mut rb);
        assert_eq!(msg["message"], "client_1: hi");
        assert_eq!(msg["from"], "client_1");
    }

    #[test]
    fn identification_updates_metadata_without_reply() {
        let reg = PeerRegistry::new();
        let (a, mut ra) = insert(&reg);
        let peer = reg.get(a).unwrap();
        let _ = handle_message(
            br#"{"type":"identification","clientName":"TestClient","clientType":"cli"}"#,
            &peer,
            &reg,
            LIMIT,
        );
        assert!(ra.try_recv().is_err());
        let meta = peer.metadata();
        assert_eq!(meta.client_name.as_deref(), Some("TestClient"));
        assert_eq!(meta.client_type.as_deref(), Some("cli"));
    }

    #[test]
    fn window_info_is_stored() {
        let reg = PeerRegistry::new();
        let (a, mut ra) = insert(&reg);
        let peer = reg.get(a).unwrap();
        let _ = handle_message(
            br#"{"type":"window_info","windowTitle":"Notepad","processName":"notepad.exe"}"#,
            &peer,
            &reg,
            LIMIT,
        );
        assert!(ra.try_recv().is_err());
        assert_eq!(
            peer.metadata().window_info,
            Some(json!({"windowTitle": "Notepad", "processName": "notepad.exe"}))
        );
    }

    #[test]
    fn oversized_message_is_rejected() {
        let reg = PeerRegistry::new();
        let (a, mut ra) = insert(&reg);
        let peer = reg.get(a).unwrap();
        let raw = vec![b'x'; LIMIT + 1];
        assert_eq!(handle_message(&raw, &peer, &reg, LIMIT), Handled::Rejected);
        assert_eq!(next_json(&mut ra)["type"], "error");
        assert_eq!(reg.counters().messages_received.load(Ordering::Relaxed), 0);
        assert!(peer.is_open());
    }

    #[test]
    fn accepted_message_counts_and_touches() {
        let reg = PeerRegistry::new();
        let (a, _ra) = insert(&reg);
        let peer = reg.get(a).unwrap();
        let before = peer.last_activity();
        let _ = handle_message(br#"{"type":"system_info"}"#, &peer, &reg, LIMIT);
        assert!(peer.last_activity() >= before);
        assert_eq!(reg.counters().messages_received.load(Ordering::Relaxed), 1);
    }
}
