use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("event is missing a report id")]
    MissingReportId,
    #[error("coordinates out of range: {latitude},{longitude}")]
    InvalidCoordinates { latitude: f64, longitude: f64 },
    #[error("malformed coordinate pair {0:?}")]
    MalformedPair(String),
    #[error("chat message text is empty")]
    EmptyText,
    #[error("invalid payload for {event}: {source}")]
    Payload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("json codec: {0}")]
    Json(#[from] serde_json::Error),
    #[error("msgpack encode: {0}")]
    MsgpackEncode(#[from] rmp_serde::encode::Error),
    #[error("msgpack decode: {0}")]
    MsgpackDecode(#[from] rmp_serde::decode::Error),
    #[error("unexpected {0} frame")]
    UnexpectedFrame(&'static str),
    #[error("malformed socket.io packet {0:?}")]
    MalformedPacket(String),
    #[error("server refused namespace connect: {0}")]
    Rejected(String),
    #[error("unknown wire format {0:?}")]
    UnknownFormat(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// A named event with its payload, independent of the framing used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new<T: Serialize>(event: &str, data: &T) -> Result<Self, WireError> {
        Ok(Self {
            event: event.to_string(),
            data: serde_json::to_value(data)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Event(Envelope),
    /// The server accepted the session; events may flow.
    Ready,
    /// Protocol-level answer that must be written back on the same link.
    Reply(Frame),
    /// Engine.IO open. The link counts as dead once nothing arrives for
    /// `heartbeat`, the server's ping interval plus ping timeout.
    Open { reply: Frame, heartbeat: Duration },
    Closed,
    Ignored,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireFormat {
    /// `{"event": .., "data": ..}` text frames.
    Json,
    /// The same envelope as named MessagePack in binary frames.
    MessagePack,
    /// Engine.IO v4 / Socket.IO v5 text framing on the default namespace.
    #[default]
    SocketIo,
}

impl WireFormat {
    pub fn requires_handshake(self) -> bool {
        matches!(self, WireFormat::SocketIo)
    }

    pub fn encode(self, envelope: &Envelope) -> Result<Frame, WireError> {
        match self {
            WireFormat::Json => Ok(Frame::Text(serde_json::to_string(envelope)?)),
            WireFormat::MessagePack => Ok(Frame::Binary(rmp_serde::to_vec_named(envelope)?)),
            WireFormat::SocketIo => {
                let packet = serde_json::to_string(&(&envelope.event, &envelope.data))?;
                Ok(Frame::Text(format!("42{packet}")))
            }
        }
    }

    pub fn decode(self, frame: &Frame) -> Result<Decoded, WireError> {
        match (self, frame) {
            (WireFormat::Json, Frame::Text(text)) => Ok(Decoded::Event(serde_json::from_str(text)?)),
            (WireFormat::Json, Frame::Binary(bytes)) => {
                Ok(Decoded::Event(serde_json::from_slice(bytes)?))
            }
            (WireFormat::MessagePack, Frame::Binary(bytes)) => {
                Ok(Decoded::Event(rmp_serde::from_slice(bytes)?))
            }
            (WireFormat::MessagePack, Frame::Text(_)) => Err(WireError::UnexpectedFrame("text")),
            (WireFormat::SocketIo, Frame::Text(text)) => decode_engine_packet(text),
            (WireFormat::SocketIo, Frame::Binary(_)) => Ok(Decoded::Ignored),
        }
    }
}

impl FromStr for WireFormat {
    type Err = WireError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(WireFormat::Json),
            "msgpack" | "messagepack" => Ok(WireFormat::MessagePack),
            "socketio" | "socket.io" => Ok(WireFormat::SocketIo),
            other => Err(WireError::UnknownFormat(other.to_string())),
        }
    }
}

// engine.io server defaults
const DEFAULT_PING_INTERVAL_MS: u64 = 25_000;
const DEFAULT_PING_TIMEOUT_MS: u64 = 20_000;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenPacket {
    ping_interval: Option<u64>,
    ping_timeout: Option<u64>,
}

impl OpenPacket {
    fn heartbeat(&self) -> Duration {
        let interval = self.ping_interval.unwrap_or(DEFAULT_PING_INTERVAL_MS);
        let timeout = self.ping_timeout.unwrap_or(DEFAULT_PING_TIMEOUT_MS);
        Duration::from_millis(interval.saturating_add(timeout))
    }
}

fn decode_engine_packet(text: &str) -> Result<Decoded, WireError> {
    let mut chars = text.chars();
    let Some(kind) = chars.next() else {
        return Ok(Decoded::Ignored);
    };
    let rest = chars.as_str();
    match kind {
        // open: join the default namespace
        '0' => {
            let open: OpenPacket = serde_json::from_str(if rest.trim().is_empty() { "{}" } else { rest })?;
            Ok(Decoded::Open {
                reply: Frame::Text("40".to_string()),
                heartbeat: open.heartbeat(),
            })
        }
        '1' => Ok(Decoded::Closed),
        '2' => Ok(Decoded::Reply(Frame::Text(format!("3{rest}")))),
        '3' | '5' | '6' => Ok(Decoded::Ignored),
        '4' => decode_socket_packet(rest),
        _ => Err(WireError::MalformedPacket(text.to_string())),
    }
}

fn decode_socket_packet(packet: &str) -> Result<Decoded, WireError> {
    let mut chars = packet.chars();
    let Some(kind) = chars.next() else {
        return Err(WireError::MalformedPacket(packet.to_string()));
    };
    let rest = chars.as_str();
    match kind {
        '0' => Ok(Decoded::Ready),
        '1' => Ok(Decoded::Closed),
        '2' => decode_socket_event(rest),
        '3' => Ok(Decoded::Ignored),
        '4' => Err(WireError::Rejected(rest.to_string())),
        '5' | '6' => Err(WireError::UnexpectedFrame("binary attachment")),
        _ => Err(WireError::MalformedPacket(packet.to_string())),
    }
}

fn decode_socket_event(body: &str) -> Result<Decoded, WireError> {
    // optional "/namespace," prefix, then an optional ack id
    let body = match body.strip_prefix('/') {
        Some(scoped) => scoped.split_once(',').map(|(_, tail)| tail).unwrap_or(""),
        None => body,
    };
    let body = body.trim_start_matches(|c: char| c.is_ascii_digit());

    let values: Vec<Value> = serde_json::from_str(body)?;
    let mut values = values.into_iter();
    let Some(Value::String(event)) = values.next() else {
        return Err(WireError::MalformedPacket(body.to_string()));
    };
    Ok(Decoded::Event(Envelope {
        event,
        data: values.next().unwrap_or(Value::Null),
    }))
}
