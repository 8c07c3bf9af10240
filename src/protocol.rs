//! Socket.IO wire protocol
//!
//! Just enough Engine.IO v4 / Socket.IO v5 over a WebSocket transport for a
//! client that announces itself and pushes hotword events. Binary buffers go
//! out as a placeholder in the JSON packet followed by one binary frame.

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use url::Url;

/// Role announced to the server in the `init` handshake
pub const NODE_ROLE: &str = "hotword-node";

pub const INIT_EVENT: &str = "init";
pub const HOTWORD_EVENT: &str = "hotword-detected";

/// Engine.IO path and query for a websocket-only session
const SOCKET_PATH: &str = "/socket.io/";
const SOCKET_QUERY: &str = "EIO=4&transport=websocket";

#[derive(Error, Debug, PartialEq)]
pub enum ProtocolError {
    #[error("Empty packet")]
    Empty,

    #[error("Unknown packet type: {0:?}")]
    UnknownType(char),

    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("Unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),
}

/// Engine.IO open packet body
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    pub sid: String,
    /// Milliseconds between server pings
    pub ping_interval: u64,
    /// Milliseconds the server waits for a pong
    pub ping_timeout: u64,
}

/// Packets the client reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Open(OpenHandshake),
    Close,
    Ping,
    Pong,
    Noop,
    /// Namespace connect acknowledged
    Connected,
    /// Server dropped the namespace
    Disconnected,
    ConnectError(String),
    Event { name: String, args: Vec<Value> },
    /// Acks and binary packets, which this client never requests
    Ignored,
}

/// Body of a `hotword-detected` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotwordPayload {
    pub hotword: String,
    /// s16le audio tail that triggered the detection
    pub buffer: Vec<u8>,
}

impl HotwordPayload {
    /// Text packet with a binary placeholder, then the attachment itself
    pub fn into_packets(self) -> (String, Vec<u8>) {
        let body = json!([
            HOTWORD_EVENT,
            { "hotword": self.hotword, "buffer": { "_placeholder": true, "num": 0 } }
        ]);

        (format!("451-{}", body), self.buffer)
    }
}

/// Namespace connect request
pub fn connect_packet() -> String {
    "40".to_string()
}

pub fn pong_packet() -> String {
    "3".to_string()
}

/// Plain event packet: `42["name",data]`
pub fn event_packet(name: &str, data: Value) -> String {
    format!("42{}", json!([name, data]))
}

/// Identity announcement sent right after connecting
pub fn init_packet() -> String {
    event_packet(INIT_EVENT, json!(NODE_ROLE))
}

/// Decode one text frame
pub fn decode(text: &str) -> Result<Inbound, ProtocolError> {
    let mut chars = text.chars();
    let kind = chars.next().ok_or(ProtocolError::Empty)?;
    let rest = chars.as_str();

    match kind {
        '0' => serde_json::from_str(rest)
            .map(Inbound::Open)
            .map_err(|e| ProtocolError::Malformed(format!("open packet: {e}"))),
        '1' => Ok(Inbound::Close),
        '2' => Ok(Inbound::Ping),
        '3' => Ok(Inbound::Pong),
        '4' => decode_socket(rest),
        '6' => Ok(Inbound::Noop),
        other => Err(ProtocolError::UnknownType(other)),
    }
}

fn decode_socket(packet: &str) -> Result<Inbound, ProtocolError> {
    let mut chars = packet.chars();
    let kind = chars.next().ok_or(ProtocolError::Empty)?;
    let rest = chars.as_str();

    match kind {
        '0' => Ok(Inbound::Connected),
        '1' => Ok(Inbound::Disconnected),
        '2' => decode_event(rest),
        '3' | '5' | '6' => Ok(Inbound::Ignored),
        '4' => {
            let message = serde_json::from_str::<Value>(rest)
                .ok()
                .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| rest.to_string());
            Ok(Inbound::ConnectError(message))
        }
        other => Err(ProtocolError::UnknownType(other)),
    }
}

/// `[<namespace>,][<ack id>]["name", args...]`
fn decode_event(packet: &str) -> Result<Inbound, ProtocolError> {
    let start = packet
        .find('[')
        .ok_or_else(|| ProtocolError::Malformed("event without payload".to_string()))?;

    let mut items: Vec<Value> = serde_json::from_str(&packet[start..])
        .map_err(|e| ProtocolError::Malformed(format!("event payload: {e}")))?;

    if items.is_empty() {
        return Err(ProtocolError::Malformed("event without name".to_string()));
    }

    match items.remove(0) {
        Value::String(name) => Ok(Inbound::Event { name, args: items }),
        other => Err(ProtocolError::Malformed(format!("event name is not a string: {other}"))),
    }
}

/// Engine.IO websocket URL for an http(s) or ws(s) base URL
pub fn socket_url(base: &str) -> Result<Url, ProtocolError> {
    let mut url = Url::parse(base).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ProtocolError::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| ProtocolError::UnsupportedScheme(scheme.to_string()))?;
    url.set_path(SOCKET_PATH);
    url.set_query(Some(SOCKET_QUERY));

    Ok(url)
}
