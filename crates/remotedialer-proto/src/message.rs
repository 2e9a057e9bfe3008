//! Message envelope and its binary framing
//!
//! ```text
//! +-----------+---------------+-------------+----------------------+-----------+
//! | varint id | varint connID | varint type | varint 15000         | payload   |
//! |           |               |             | (Data / Connect only)|           |
//! +-----------+---------------+-------------+----------------------+-----------+
//! ```
//!
//! The `15000` field is a legacy per-message deadline. It carries no meaning,
//! but peers built against the original format expect to skip it, so it is
//! always written for Data and Connect and always consumed on read.
//!
//! One message travels in exactly one WebSocket binary frame, so the payload
//! runs to the end of the frame and needs no length prefix.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use bytes::{Bytes, BytesMut};

use crate::varint::{put_varint, read_varint, MAX_VARINT_LEN};
use crate::ProtoError;

/// Legacy deadline placeholder written after the header of Data and Connect.
pub const LEGACY_DEADLINE_MS: i64 = 15_000;

/// Largest Connect target or client identity accepted on the wire.
pub const MAX_CONTROL_PAYLOAD: usize = 100;

const EOF_TEXT: &str = "EOF";

static NEXT_MESSAGE_ID: AtomicI64 = AtomicI64::new(0);

/// Allocate the next process-wide message id.
///
/// Ids only need to be unique and increasing for diagnostics; nothing orders
/// messages by them.
pub fn next_message_id() -> i64 {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed) + 1
}

/// Message type codes as they appear on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Stream bytes
    Data = 1,
    /// Open a stream
    Connect = 2,
    /// Terminate a stream
    Error = 3,
    /// A peer can now reach a client identity
    AddClient = 4,
    /// A peer can no longer reach a client identity through one session
    RemoveClient = 5,
    /// Stop sending Data on a stream
    Pause = 6,
    /// Resume sending Data on a stream
    Resume = 7,
}

impl MessageType {
    /// Map a wire code back to a type, `None` for codes this build does not know.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Data),
            2 => Some(Self::Connect),
            3 => Some(Self::Error),
            4 => Some(Self::AddClient),
            5 => Some(Self::RemoveClient),
            6 => Some(Self::Pause),
            7 => Some(Self::Resume),
            _ => None,
        }
    }

    /// Wire code
    pub fn code(self) -> i64 {
        self as i64
    }

    /// Lowercase name, used for log fields and metric labels
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Connect => "connect",
            Self::Error => "error",
            Self::AddClient => "add_client",
            Self::RemoveClient => "remove_client",
            Self::Pause => "pause",
            Self::Resume => "resume",
        }
    }

    /// Whether the legacy deadline field follows the header
    fn has_legacy_deadline(self) -> bool {
        matches!(self, Self::Data | Self::Connect)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason carried by an Error message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The remote end closed cleanly (`"EOF"` on the wire)
    Eof,
    /// Any other failure text
    Message(String),
}

impl RemoteError {
    fn from_wire(text: &str) -> Self {
        if text == EOF_TEXT {
            Self::Eof
        } else {
            Self::Message(text.to_string())
        }
    }

    fn as_wire(&self) -> &str {
        match self {
            Self::Eof => EOF_TEXT,
            Self::Message(text) => text,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Typed body of a message, one variant per [`MessageType`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Raw stream bytes
    Data(Bytes),
    /// Stream open request
    Connect {
        /// Network protocol, possibly federated (`client::tcp`)
        proto: String,
        /// Target address understood by the far side's dialer
        address: String,
    },
    /// Stream termination
    Error(RemoteError),
    /// Client identity reachable through the sender
    AddClient(String),
    /// Client identity no longer reachable through one of the sender's sessions
    RemoveClient(String),
    /// Flow control: stop sending
    Pause,
    /// Flow control: start sending again
    Resume,
    /// A type code this build does not understand; dropped by the session
    Unknown {
        /// Raw type code
        code: i64,
        /// Everything after the header
        body: Bytes,
    },
}

/// One protocol unit, carried in one WebSocket binary frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Diagnostic id, unique per process
    pub id: i64,
    /// Logical stream id; for AddClient/RemoveClient the announcing session key
    pub conn_id: i64,
    /// Typed body
    pub payload: Payload,
}

impl Message {
    fn new(conn_id: i64, payload: Payload) -> Self {
        Self {
            id: next_message_id(),
            conn_id,
            payload,
        }
    }

    /// Data message carrying `bytes` for `conn_id`
    pub fn data(conn_id: i64, bytes: Bytes) -> Self {
        Self::new(conn_id, Payload::Data(bytes))
    }

    /// Connect message opening `conn_id` to `proto/address`
    pub fn connect(conn_id: i64, proto: impl Into<String>, address: impl Into<String>) -> Self {
        Self::new(
            conn_id,
            Payload::Connect {
                proto: proto.into(),
                address: address.into(),
            },
        )
    }

    /// Error message terminating `conn_id`
    pub fn error(conn_id: i64, err: RemoteError) -> Self {
        Self::new(conn_id, Payload::Error(err))
    }

    /// AddClient announcement for `client_key`, reachable via `session_key`
    pub fn add_client(session_key: i64, client_key: impl Into<String>) -> Self {
        Self::new(session_key, Payload::AddClient(client_key.into()))
    }

    /// RemoveClient announcement for `client_key` on `session_key`
    pub fn remove_client(session_key: i64, client_key: impl Into<String>) -> Self {
        Self::new(session_key, Payload::RemoveClient(client_key.into()))
    }

    /// Pause message for `conn_id`
    pub fn pause(conn_id: i64) -> Self {
        Self::new(conn_id, Payload::Pause)
    }

    /// Resume message for `conn_id`
    pub fn resume(conn_id: i64) -> Self {
        Self::new(conn_id, Payload::Resume)
    }

    /// Known type of this message, `None` for [`Payload::Unknown`]
    pub fn message_type(&self) -> Option<MessageType> {
        match &self.payload {
            Payload::Data(_) => Some(MessageType::Data),
            Payload::Connect { .. } => Some(MessageType::Connect),
            Payload::Error(_) => Some(MessageType::Error),
            Payload::AddClient(_) => Some(MessageType::AddClient),
            Payload::RemoveClient(_) => Some(MessageType::RemoveClient),
            Payload::Pause => Some(MessageType::Pause),
            Payload::Resume => Some(MessageType::Resume),
            Payload::Unknown { .. } => None,
        }
    }

    /// Wire type code, including unknown codes
    pub fn type_code(&self) -> i64 {
        match &self.payload {
            Payload::Unknown { code, .. } => *code,
            _ => self.message_type().map(MessageType::code).unwrap_or_default(),
        }
    }

    /// Length of the stream bytes carried, zero for control messages
    pub fn data_len(&self) -> usize {
        match &self.payload {
            Payload::Data(bytes) => bytes.len(),
            _ => 0,
        }
    }

    /// Serialize into a single frame
    pub fn encode(&self) -> Result<Bytes, ProtoError> {
        let connect_target;
        let body: &[u8] = match &self.payload {
            Payload::Data(bytes) => bytes.as_ref(),
            Payload::Connect { proto, address } => {
                connect_target = format!("{proto}/{address}");
                check_control_len("connect", connect_target.len())?;
                connect_target.as_bytes()
            }
            Payload::Error(err) => err.as_wire().as_bytes(),
            Payload::AddClient(key) => {
                check_control_len("add_client", key.len())?;
                key.as_bytes()
            }
            Payload::RemoveClient(key) => {
                check_control_len("remove_client", key.len())?;
                key.as_bytes()
            }
            Payload::Pause | Payload::Resume => &[],
            Payload::Unknown { body, .. } => body.as_ref(),
        };

        let mut buf = BytesMut::with_capacity(MAX_VARINT_LEN * 4 + body.len());
        put_varint(&mut buf, self.id);
        put_varint(&mut buf, self.conn_id);
        put_varint(&mut buf, self.type_code());
        if self
            .message_type()
            .is_some_and(MessageType::has_legacy_deadline)
        {
            put_varint(&mut buf, LEGACY_DEADLINE_MS);
        }
        buf.extend_from_slice(body);
        Ok(buf.freeze())
    }

    /// Parse one frame
    ///
    /// Unknown type codes decode to [`Payload::Unknown`] rather than failing,
    /// so newer peers can add message types without breaking older ones.
    pub fn decode(mut frame: Bytes) -> Result<Self, ProtoError> {
        let id = read_varint(&mut frame)?;
        let conn_id = read_varint(&mut frame)?;
        let code = read_varint(&mut frame)?;

        let Some(kind) = MessageType::from_code(code) else {
            return Ok(Self {
                id,
                conn_id,
                payload: Payload::Unknown { code, body: frame },
            });
        };

        if kind.has_legacy_deadline() {
            // Write-only field: consumed and ignored.
            read_varint(&mut frame)?;
        }

        let payload = match kind {
            MessageType::Data => Payload::Data(frame),
            MessageType::Connect => {
                let target = control_text("connect", &frame)?;
                let (proto, address) = target
                    .split_once('/')
                    .ok_or_else(|| ProtoError::MalformedConnect(target.to_string()))?;
                Payload::Connect {
                    proto: proto.to_string(),
                    address: address.to_string(),
                }
            }
            MessageType::Error => {
                Payload::Error(RemoteError::from_wire(&String::from_utf8_lossy(&frame)))
            }
            MessageType::AddClient => {
                Payload::AddClient(control_text("add_client", &frame)?.to_string())
            }
            MessageType::RemoveClient => {
                Payload::RemoveClient(control_text("remove_client", &frame)?.to_string())
            }
            MessageType::Pause => Payload::Pause,
            MessageType::Resume => Payload::Resume,
        };

        Ok(Self {
            id,
            conn_id,
            payload,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Payload::Data(bytes) => write!(
                f,
                "{} DATA conn={} len={}",
                self.id,
                self.conn_id,
                bytes.len()
            ),
            Payload::Connect { proto, address } => write!(
                f,
                "{} CONNECT conn={} target={proto}/{address}",
                self.id, self.conn_id
            ),
            Payload::Error(err) => write!(f, "{} ERROR conn={} err={err}", self.id, self.conn_id),
            Payload::AddClient(key) => {
                write!(f, "{} ADDCLIENT session={} key={key}", self.id, self.conn_id)
            }
            Payload::RemoveClient(key) => {
                write!(f, "{} REMOVECLIENT session={} key={key}", self.id, self.conn_id)
            }
            Payload::Pause => write!(f, "{} PAUSE conn={}", self.id, self.conn_id),
            Payload::Resume => write!(f, "{} RESUME conn={}", self.id, self.conn_id),
            Payload::Unknown { code, .. } => {
                write!(f, "{} UNKNOWN({code}) conn={}", self.id, self.conn_id)
            }
        }
    }
}

fn check_control_len(kind: &'static str, len: usize) -> Result<(), ProtoError> {
    if len > MAX_CONTROL_PAYLOAD {
        return Err(ProtoError::PayloadTooLarge {
            kind,
            len,
            limit: MAX_CONTROL_PAYLOAD,
        });
    }
    Ok(())
}

fn control_text<'a>(kind: &'static str, body: &'a [u8]) -> Result<&'a str, ProtoError> {
    check_control_len(kind, body.len())?;
    std::str::from_utf8(body).map_err(|_| ProtoError::InvalidUtf8(kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(message: &Message) -> Message {
        let frame = message.encode().expect("encode should succeed");
        Message::decode(frame).expect("decode should succeed")
    }

    #[test]
    fn test_message_ids_increase() {
        let first = Message::pause(1);
        let second = Message::pause(1);
        assert!(second.id > first.id);
    }

    #[test]
    fn test_data_survives_framing() {
        let message = Message::data(42, Bytes::from_static(b"hello tunnel"));
        let decoded = decode(&message);
        assert_eq!(decoded, message);
        assert_eq!(decoded.data_len(), 12);
    }

    #[test]
    fn test_connect_wire_layout() {
        let message = Message {
            id: 1,
            conn_id: 2,
            payload: Payload::Connect {
                proto: "tcp".into(),
                address: "127.0.0.1:9".into(),
            },
        };
        let frame = message.encode().expect("encode should succeed");

        let mut expected = vec![0x02, 0x04, 0x04, 0xb0, 0xea, 0x01];
        expected.extend_from_slice(b"tcp/127.0.0.1:9");
        assert_eq!(frame.as_ref(), expected.as_slice());
    }

    #[test]
    fn test_control_messages_skip_legacy_deadline() {
        let message = Message {
            id: 1,
            conn_id: 3,
            payload: Payload::Pause,
        };
        let frame = message.encode().expect("encode should succeed");
        assert_eq!(frame.as_ref(), &[0x02, 0x06, 0x0c]);

        let message = Message {
            id: 1,
            conn_id: 3,
            payload: Payload::Error(RemoteError::Eof),
        };
        let frame = message.encode().expect("encode should succeed");
        assert_eq!(frame.as_ref(), b"\x02\x06\x06EOF");
    }

    #[test]
    fn test_connect_with_federated_proto() {
        let message = Message::connect(9, "agent-1::tcp", "10.0.0.5:6443");
        let decoded = decode(&message);
        assert_eq!(
            decoded.payload,
            Payload::Connect {
                proto: "agent-1::tcp".into(),
                address: "10.0.0.5:6443".into(),
            }
        );
    }

    #[test]
    fn test_connect_address_may_contain_slash() {
        let message = Message::connect(1, "unix", "/var/run/agent.sock");
        let decoded = decode(&message);
        assert_eq!(
            decoded.payload,
            Payload::Connect {
                proto: "unix".into(),
                address: "/var/run/agent.sock".into(),
            }
        );
    }

    #[test]
    fn test_error_eof_maps_to_end_of_stream() {
        let decoded = decode(&Message::error(5, RemoteError::Eof));
        assert_eq!(decoded.payload, Payload::Error(RemoteError::Eof));

        let decoded = decode(&Message::error(5, RemoteError::Message("connection refused".into())));
        assert_eq!(
            decoded.payload,
            Payload::Error(RemoteError::Message("connection refused".into()))
        );
    }

    #[test]
    fn test_add_and_remove_client_carry_session_key() {
        let decoded = decode(&Message::add_client(77, "edge-1"));
        assert_eq!(decoded.conn_id, 77);
        assert_eq!(decoded.payload, Payload::AddClient("edge-1".into()));

        let decoded = decode(&Message::remove_client(77, "edge-1"));
        assert_eq!(decoded.payload, Payload::RemoveClient("edge-1".into()));
    }

    #[test]
    fn test_unknown_type_decodes_softly() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 10);
        put_varint(&mut buf, 4);
        put_varint(&mut buf, 99);
        buf.extend_from_slice(b"future");

        let decoded = Message::decode(buf.freeze()).expect("unknown types are not errors");
        assert_eq!(decoded.message_type(), None);
        assert_eq!(decoded.type_code(), 99);
        assert_eq!(
            decoded.payload,
            Payload::Unknown {
                code: 99,
                body: Bytes::from_static(b"future"),
            }
        );
    }

    #[test]
    fn test_truncated_header_is_framing_error() {
        assert_eq!(
            Message::decode(Bytes::from_static(&[0x02, 0x04])),
            Err(ProtoError::Truncated)
        );
        // Data header present but legacy deadline missing.
        assert_eq!(
            Message::decode(Bytes::from_static(&[0x02, 0x04, 0x02])),
            Err(ProtoError::Truncated)
        );
        assert_eq!(Message::decode(Bytes::new()), Err(ProtoError::Truncated));
    }

    #[test]
    fn test_oversized_connect_rejected_both_ways() {
        let address = "a".repeat(MAX_CONTROL_PAYLOAD);
        let message = Message::connect(1, "tcp", address);
        assert!(matches!(
            message.encode(),
            Err(ProtoError::PayloadTooLarge { kind: "connect", .. })
        ));

        let mut buf = BytesMut::new();
        put_varint(&mut buf, 1);
        put_varint(&mut buf, 1);
        put_varint(&mut buf, MessageType::AddClient.code());
        buf.extend_from_slice(&[b'k'; MAX_CONTROL_PAYLOAD + 1]);
        assert!(matches!(
            Message::decode(buf.freeze()),
            Err(ProtoError::PayloadTooLarge { kind: "add_client", .. })
        ));
    }

    #[test]
    fn test_connect_without_separator_is_malformed() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 1);
        put_varint(&mut buf, 1);
        put_varint(&mut buf, MessageType::Connect.code());
        put_varint(&mut buf, LEGACY_DEADLINE_MS);
        buf.extend_from_slice(b"tcp");
        assert_eq!(
            Message::decode(buf.freeze()),
            Err(ProtoError::MalformedConnect("tcp".into()))
        );
    }

    #[test]
    fn test_legacy_deadline_value_is_ignored_on_read() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 3);
        put_varint(&mut buf, 8);
        put_varint(&mut buf, MessageType::Data.code());
        put_varint(&mut buf, 60_000);
        buf.extend_from_slice(b"xyz");

        let decoded = Message::decode(buf.freeze()).expect("decode should succeed");
        assert_eq!(decoded.payload, Payload::Data(Bytes::from_static(b"xyz")));
    }

    #[test]
    fn test_message_type_codes() {
        for code in 1..=7 {
            let kind = MessageType::from_code(code).expect("codes 1..=7 are defined");
            assert_eq!(kind.code(), code);
        }
        assert_eq!(MessageType::from_code(0), None);
        assert_eq!(MessageType::from_code(8), None);
        assert_eq!(MessageType::AddClient.to_string(), "add_client");
    }

    #[test]
    fn test_display_is_compact() {
        let message = Message {
            id: 4,
            conn_id: 2,
            payload: Payload::Connect {
                proto: "tcp".into(),
                address: "127.0.0.1:22".into(),
            },
        };
        assert_eq!(message.to_string(), "4 CONNECT conn=2 target=tcp/127.0.0.1:22");
    }
}
