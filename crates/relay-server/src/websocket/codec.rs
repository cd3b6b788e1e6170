//! Wire envelopes: total parsing of inbound payloads and stamped encoding of
//! outbound ones.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use super::peer::PeerId;
use crate::status::{SERVER_NAME, SERVER_VERSION};

/// Declared type of an inbound envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// `ping`
    Ping,
    /// `system_info`
    SystemInfo,
    /// `window_info`
    WindowInfo,
    /// `broadcast`
    Broadcast,
    /// `identification`
    Identification,
    /// `text`, also produced for payloads that are not JSON objects.
    Text,
    /// Any other string tag.
    Other(String),
    /// No string `type` field.
    Untyped,
}

impl MessageKind {
    /// Classify a `type` tag.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "ping" => Self::Ping,
            "system_info" => Self::SystemInfo,
            "window_info" => Self::WindowInfo,
            "broadcast" => Self::Broadcast,
            "identification" => Self::Identification,
            "text" => Self::Text,
            other => Self::Other(other.to_owned()),
        }
    }

    /// The wire tag, if the envelope had one.
    pub fn tag(&self) -> Option<&str> {
        match self {
            Self::Ping => Some("ping"),
            Self::SystemInfo => Some("system_info"),
            Self::WindowInfo => Some("window_info"),
            Self::Broadcast => Some("broadcast"),
            Self::Identification => Some("identification"),
            Self::Text => Some("text"),
            Self::Other(tag) => Some(tag),
            Self::Untyped => None,
        }
    }

    /// Bounded label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::SystemInfo => "system_info",
            Self::WindowInfo => "window_info",
            Self::Broadcast => "broadcast",
            Self::Identification => "identification",
            Self::Text => "text",
            Self::Other(_) => "other",
            Self::Untyped => "untyped",
        }
    }
}

/// A parsed inbound message.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    /// Declared type.
    pub kind: MessageKind,
    /// Producer-supplied timestamp, used for correlation only.
    pub timestamp: Option<String>,
    /// Every other field.
    pub fields: Map<String, Value>,
}

impl Envelope {
    /// Fallback envelope for payloads that are not JSON objects.
    pub fn text(content: impl Into<String>) -> Self {
        let mut fields = Map::new();
        let _ = fields.insert("content".into(), Value::String(content.into()));
        Self {
            kind: MessageKind::Text,
            timestamp: None,
            fields,
        }
    }

    /// A payload field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// A payload field, if it is a string.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(Value::as_str)
    }

    /// Rebuild the JSON object this envelope was parsed from.
    pub fn to_value(&self) -> Value {
        let mut map = self.fields.clone();
        if let Some(tag) = self.kind.tag() {
            let _ = map.insert("type".into(), Value::String(tag.to_owned()));
        }
        if let Some(ts) = &self.timestamp {
            let _ = map.insert("timestamp".into(), Value::String(ts.clone()));
        }
        Value::Object(map)
    }
}

/// Parse raw inbound bytes. Never fails.
///
/// Non-UTF-8 bytes are decoded lossily; anything that is not a JSON object
/// becomes a `text` envelope carrying the raw input as `content`.
pub fn parse(raw: &[u8]) -> Envelope {
    let text = String::from_utf8_lossy(raw);
    let Ok(Value::Object(mut fields)) = serde_json::from_str::<Value>(&text) else {
        return Envelope::text(text.into_owned());
    };

    let kind = match fields.remove("type") {
        Some(Value::String(tag)) => MessageKind::from_tag(&tag),
        Some(other) => {
            let _ = fields.insert("type".into(), other);
            MessageKind::Untyped
        }
        None => MessageKind::Untyped,
    };
    let timestamp = match fields.remove("timestamp") {
        Some(Value::String(ts)) => Some(ts),
        Some(other) => {
            let _ = fields.insert("timestamp".into(), other);
            None
        }
        None => None,
    };

    Envelope {
        kind,
        timestamp,
        fields,
    }
}

/// Name/version block of the `welcome` envelope.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ServerInfo {
    /// Server name.
    pub name: String,
    /// Server version.
    pub version: String,
}

/// Outbound envelopes.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// First message on every connection.
    Welcome {
        /// Assigned peer id.
        client_id: String,
        /// Greeting.
        message: String,
        /// Server name and version.
        server_info: ServerInfo,
    },
    /// Reply to an inbound `ping`.
    Pong {
        /// Timestamp carried by the `ping`, for round-trip measurement.
        #[serde(skip_serializing_if = "Option::is_none")]
        original_timestamp: Option<String>,
    },
    /// Keepalive probe.
    ServerPing {
        /// Probed peer.
        client_id: String,
        /// Probe text.
        message: String,
    },
    /// Reply wrapping an envelope the relay has no handler for.
    Echo {
        /// The inbound envelope.
        original_message: Value,
        /// Always `"server"`.
        from: String,
    },
    /// Fan-out message.
    Broadcast {
        /// Text delivered to every recipient.
        message: String,
        /// Originating peer id, or `"server"`.
        from: String,
    },
    /// Inbound message was rejected.
    Error {
        /// Short description.
        message: String,
        /// Failure detail.
        error: String,
    },
}

impl ServerMessage {
    /// `welcome` for a freshly registered peer.
    pub fn welcome(id: PeerId) -> Self {
        Self::Welcome {
            client_id: id.to_string(),
            message: format!("Connected to {SERVER_NAME}"),
            server_info: ServerInfo {
                name: SERVER_NAME.into(),
                version: SERVER_VERSION.into(),
            },
        }
    }

    /// Keepalive probe for `id`.
    pub fn server_ping(id: PeerId) -> Self {
        Self::ServerPing {
            client_id: id.to_string(),
            message: "keepalive".into(),
        }
    }

    /// `broadcast` from `from`.
    pub fn broadcast(message: impl Into<String>, from: impl Into<String>) -> Self {
        Self::Broadcast {
            message: message.into(),
            from: from.into(),
        }
    }

    /// `echo` wrapping `envelope`.
    pub fn echo(envelope: &Envelope) -> Self {
        Self::Echo {
            original_message: envelope.to_value(),
            from: "server".into(),
        }
    }

    /// Wire tag of this message.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::Pong { .. } => "pong",
            Self::ServerPing { .. } => "server_ping",
            Self::Echo { .. } => "echo",
            Self::Broadcast { .. } => "broadcast",
            Self::Error { .. } => "error",
        }
    }
}

/// Encode `message`, stamping the current time.
pub fn serialize(message: &ServerMessage) -> serde_json::Result<String> {
    serialize_at(message, Utc::now())
}

/// Encode `message` with an explicit `timestamp`.
///
/// Output is deterministic: object keys are emitted in sorted order.
pub fn serialize_at(message: &ServerMessage, at: DateTime<Utc>) -> serde_json::Result<String> {
    let mut value = serde_json::to_value(message)?;
    if let Value::Object(map) = &mut value {
        let _ = map.insert(
            "timestamp".into(),
            Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
    }
    serde_json::to_string(&value)
}
