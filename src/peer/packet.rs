//! Socket.IO v5 packets over Engine.IO v4, websocket transport only.
//!
//! A text frame is an Engine.IO packet: one type digit followed by its payload. Message packets
//! (`4`) carry a Socket.IO packet: a type digit, an attachment count for binary events, an
//! optional `/namespace,` prefix, an optional ack id and a JSON payload, e.g.
//! `42["cloudServerMsg",{..}]` or `451-/ide,["cloudServerMsg",{"_placeholder":true,"num":0}]`.
//! Binary attachments follow a binary event as separate binary frames.

use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tether_schema::TransportFrame;
use tether_sqlcore::buffer_value;
use thiserror::Error as ThisError;
use url::Url;

pub(crate) const ENGINE_PATH: &str = "/socket.io/";
pub(crate) const PONG: &str = "3";

#[derive(Debug, ThisError, PartialEq, Eq)]
pub(crate) enum PacketError {
    #[error("empty packet")]
    Empty,

    #[error("unknown packet type '{0}'")]
    UnknownType(char),

    #[error("malformed packet: {0}")]
    Malformed(String),
}

/// Engine.IO handshake sent by the server right after the upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Handshake {
    pub sid: String,
    pub ping_interval: u64,
    pub ping_timeout: u64,
}

impl Handshake {
    /// Silence after which the server is considered gone.
    pub fn idle_limit(&self) -> Duration {
        Duration::from_millis(self.ping_interval + self.ping_timeout)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Packet {
    Open(Handshake),
    Close,
    Ping,
    Pong,
    Noop,
    Connect {
        namespace: String,
    },
    ConnectError {
        namespace: String,
        message: String,
    },
    Disconnect {
        namespace: String,
    },
    Event {
        namespace: String,
        frame: TransportFrame,
    },
    BinaryEvent {
        namespace: String,
        attachments: usize,
        frame: TransportFrame,
    },
    /// Acks and other packets nothing here reacts to.
    Other,
}

/// Engine endpoint for a peer URL. The URL path names the namespace, not the endpoint.
pub(crate) fn engine_url(url: &Url) -> Url {
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => other,
    };
    let mut endpoint = url.clone();
    if endpoint.scheme() != scheme {
        // Only fails between special and non-special schemes, which http/ws are not.
        let _ = endpoint.set_scheme(scheme);
    }
    endpoint.set_path(ENGINE_PATH);
    endpoint.set_fragment(None);
    endpoint
        .query_pairs_mut()
        .append_pair("EIO", "4")
        .append_pair("transport", "websocket");
    endpoint
}

/// Namespace addressed by a peer URL, `/` unless the URL has a path.
pub(crate) fn namespace_of(url: &Url) -> String {
    let path = url.path().trim_end_matches('/');
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

fn namespace_prefix(namespace: &str) -> String {
    if namespace == "/" {
        String::new()
    } else {
        format!("{namespace},")
    }
}

pub(crate) fn encode_connect(namespace: &str) -> String {
    format!("40{}", namespace_prefix(namespace))
}

pub(crate) fn encode_event(namespace: &str, frame: &TransportFrame) -> String {
    let args = json!([frame.event, frame.data]);
    format!("42{}{args}", namespace_prefix(namespace))
}

pub(crate) fn decode(text: &str) -> Result<Packet, PacketError> {
    let mut chars = text.chars();
    let kind = chars.next().ok_or(PacketError::Empty)?;
    let rest = chars.as_str();
    match kind {
        '0' => serde_json::from_str(rest)
            .map(Packet::Open)
            .map_err(|e| PacketError::Malformed(format!("handshake: {e}"))),
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping),
        '3' => Ok(Packet::Pong),
        '6' => Ok(Packet::Noop),
        '4' => decode_message(rest),
        other => Err(PacketError::UnknownType(other)),
    }
}

fn decode_message(text: &str) -> Result<Packet, PacketError> {
    let mut chars = text.chars();
    let kind = chars.next().ok_or(PacketError::Empty)?;
    let mut rest = chars.as_str();

    let mut attachments = 0;
    if kind == '5' {
        let (count, tail) = rest
            .split_once('-')
            .ok_or_else(|| PacketError::Malformed("binary event without attachment count".into()))?;
        attachments = count
            .parse()
            .map_err(|_| PacketError::Malformed(format!("attachment count '{count}'")))?;
        rest = tail;
    }

    let namespace = if rest.starts_with('/') {
        let (ns, tail) = rest.split_once(',').unwrap_or((rest, ""));
        rest = tail;
        ns.to_string()
    } else {
        "/".to_string()
    };

    // Ack id.
    rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());

    match kind {
        '0' => Ok(Packet::Connect { namespace }),
        '1' => Ok(Packet::Disconnect { namespace }),
        '4' => {
            let message = serde_json::from_str::<Value>(rest)
                .ok()
                .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| rest.to_string());
            Ok(Packet::ConnectError { namespace, message })
        }
        '2' => Ok(Packet::Event {
            namespace,
            frame: event_frame(rest)?,
        }),
        '5' => Ok(Packet::BinaryEvent {
            namespace,
            attachments,
            frame: event_frame(rest)?,
        }),
        '3' | '6' => Ok(Packet::Other),
        other => Err(PacketError::UnknownType(other)),
    }
}

fn event_frame(payload: &str) -> Result<TransportFrame, PacketError> {
    let args: Vec<Value> = serde_json::from_str(payload)
        .map_err(|e| PacketError::Malformed(format!("event payload: {e}")))?;
    let mut args = args.into_iter();
    let event = match args.next() {
        Some(Value::String(event)) => event,
        _ => return Err(PacketError::Malformed("event without a name".into())),
    };
    Ok(TransportFrame {
        event,
        data: args.next().unwrap_or(Value::Null),
    })
}

/// Replaces attachment placeholders with tagged wire buffers.
pub(crate) fn fill_placeholders(value: &mut Value, attachments: &[Vec<u8>]) {
    if let Some(bytes) = placeholder_slot(value, attachments) {
        *value = buffer_value(bytes);
        return;
    }
    match value {
        Value::Object(map) => map.values_mut().for_each(|v| fill_placeholders(v, attachments)),
        Value::Array(items) => items.iter_mut().for_each(|v| fill_placeholders(v, attachments)),
        _ => {}
    }
}

fn placeholder_slot<'a>(value: &Value, attachments: &'a [Vec<u8>]) -> Option<&'a Vec<u8>> {
    if value.get("_placeholder") != Some(&Value::Bool(true)) {
        return None;
    }
    let num = usize::try_from(value.get("num")?.as_u64()?).ok()?;
    attachments.get(num)
}

/// A binary event waiting for its attachments.
#[derive(Debug)]
pub(crate) struct PendingBinary {
    frame: TransportFrame,
    expected: usize,
    received: Vec<Vec<u8>>,
}

impl PendingBinary {
    pub fn new(frame: TransportFrame, expected: usize) -> Self {
        Self {
            frame,
            expected,
            received: Vec::with_capacity(expected),
        }
    }

    /// Adds one attachment. Returns the completed frame after the last one.
    pub fn push(&mut self, bytes: Vec<u8>) -> Option<TransportFrame> {
        self.received.push(bytes);
        (self.received.len() >= self.expected).then(|| {
            let mut frame = TransportFrame {
                event: std::mem::take(&mut self.frame.event),
                data: self.frame.data.take(),
            };
            fill_placeholders(&mut frame.data, &self.received);
            frame
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_schema::{EVENT_INBOUND, EVENT_OUTBOUND};
    use tether_sqlcore::decode_buffer;

    #[test]
    fn engine_url_targets_the_socket_endpoint() {
        let url = Url::parse("https://apps.example.com/ide?token=t").unwrap();
        assert_eq!(
            engine_url(&url).as_str(),
            "wss://apps.example.com/socket.io/?token=t&EIO=4&transport=websocket"
        );
        assert_eq!(namespace_of(&url), "/ide");

        let url = Url::parse("http://localhost:8081").unwrap();
        assert_eq!(
            engine_url(&url).as_str(),
            "ws://localhost:8081/socket.io/?EIO=4&transport=websocket"
        );
        assert_eq!(namespace_of(&url), "/");
    }

    #[test]
    fn handshake_and_control_packets() {
        let open = decode(r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#)
            .unwrap();
        let Packet::Open(handshake) = open else {
            panic!("expected open, got {open:?}");
        };
        assert_eq!(handshake.sid, "abc");
        assert_eq!(handshake.idle_limit(), Duration::from_secs(45));

        assert_eq!(decode("2").unwrap(), Packet::Ping);
        assert_eq!(decode("1").unwrap(), Packet::Close);
        assert_eq!(
            decode(r#"40{"sid":"x"}"#).unwrap(),
            Packet::Connect { namespace: "/".into() }
        );
        assert_eq!(
            decode("41/ide,").unwrap(),
            Packet::Disconnect { namespace: "/ide".into() }
        );
        assert_eq!(
            decode(r#"44{"message":"Not authorized"}"#).unwrap(),
            Packet::ConnectError {
                namespace: "/".into(),
                message: "Not authorized".into()
            }
        );
        assert_eq!(decode(""), Err(PacketError::Empty));
        assert_eq!(decode("9"), Err(PacketError::UnknownType('9')));
    }

    #[test]
    fn events_carry_name_and_first_argument() {
        let packet = decode(r#"42/ide,17["cloudServerMsg",{"cmd":"ping","app":true}]"#).unwrap();
        assert_eq!(
            packet,
            Packet::Event {
                namespace: "/ide".into(),
                frame: TransportFrame {
                    event: EVENT_INBOUND.into(),
                    data: json!({ "cmd": "ping", "app": true }),
                },
            }
        );
        assert!(matches!(decode(r#"42[12]"#), Err(PacketError::Malformed(_))));
    }

    #[test]
    fn outbound_events_use_the_namespace_prefix() {
        let frame = TransportFrame {
            event: EVENT_OUTBOUND.into(),
            data: json!({ "type": "init" }),
        };
        assert_eq!(encode_event("/", &frame), r#"42["cloudConnector",{"type":"init"}]"#);
        assert_eq!(
            encode_event("/ide", &frame),
            r#"42/ide,["cloudConnector",{"type":"init"}]"#
        );
        assert_eq!(encode_connect("/"), "40");
        assert_eq!(encode_connect("/ide"), "40/ide,");
    }

    #[test]
    fn binary_attachments_become_wire_buffers() {
        let packet = decode(
            r#"451-["cloudServerMsg",{"app":true,"cmd":"changeCode","args":[{"_placeholder":true,"num":0},{"key":"k"}]}]"#,
        )
        .unwrap();
        let Packet::BinaryEvent {
            attachments, frame, ..
        } = packet
        else {
            panic!("expected binary event");
        };
        assert_eq!(attachments, 1);

        let mut pending = PendingBinary::new(frame, attachments);
        let frame = pending.push(vec![1, 2, 3]).expect("complete after one attachment");
        assert_eq!(frame.event, EVENT_INBOUND);
        assert_eq!(decode_buffer(&frame.data["args"][0]), Some(vec![1, 2, 3]));
        assert_eq!(frame.data["args"][1], json!({ "key": "k" }));
    }
}
