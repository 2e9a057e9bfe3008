//! Wire protocol for the remotedialer reverse tunnel.
//!
//! Agents sitting behind NAT keep a single outbound WebSocket open to a
//! server. The server then dials *into* the agent by multiplexing many
//! logical byte-streams over that one socket.
//!
//! # Communication Flow
//!
//! ```text
//! ┌─────────────────────────┐
//! │   remotedialer server   │
//! │                         │
//! │  ┌─────────────────┐    │
//! │  │ /connect (ws)   │◄───┼──── Agent connects outbound
//! │  └─────────────────┘    │
//! └─────────────────────────┘
//!            ▲
//!            │ one WebSocket, one Message per binary frame
//!            │ (Connect / Data / Error / Pause / Resume ...)
//!            │
//! ┌──────────┴──────────────┐
//! │          Agent          │
//! │  dials local targets    │
//! │  on the server's behalf │
//! └─────────────────────────┘
//! ```
//!
//! # Message Types
//!
//! - [`MessageType::Connect`]: open a logical stream to `proto/address`
//! - [`MessageType::Data`]: a slice of stream bytes
//! - [`MessageType::Error`]: terminate a stream (`"EOF"` is a clean close)
//! - [`MessageType::Pause`] / [`MessageType::Resume`]: per-stream flow control
//! - [`MessageType::AddClient`] / [`MessageType::RemoveClient`]: peer
//!   federation announcements, session-level (never routed to a stream)

#![deny(missing_docs)]

mod error;
mod message;
mod varint;

pub use error::ProtoError;
pub use message::{
    next_message_id, Message, MessageType, Payload, RemoteError, LEGACY_DEADLINE_MS,
    MAX_CONTROL_PAYLOAD,
};
pub use varint::{put_varint, read_varint, MAX_VARINT_LEN};

/// Separator between a federated client identity and the real protocol,
/// e.g. `agent-1::tcp`.
pub const CLIENT_KEY_SEPARATOR: &str = "::";

/// Split a federated network string into `(client_key, proto)`.
///
/// Returns `None` for a bare protocol such as `"tcp"`.
pub fn split_federated_network(network: &str) -> Option<(&str, &str)> {
    network.split_once(CLIENT_KEY_SEPARATOR)
}

/// Build the federated network string for dialing `proto` on `client_key`
/// through a peer server.
pub fn federated_network(client_key: &str, proto: &str) -> String {
    format!("{client_key}{CLIENT_KEY_SEPARATOR}{proto}")
}
