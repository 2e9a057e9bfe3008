//! Metrics for tunnel observability
//!
//! Provides OpenTelemetry counters for:
//! - Session lifecycle (direct agents and peer servers)
//! - Logical connection lifecycle
//! - Bytes and messages crossing each session
//! - Peer link reconnects

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::KeyValue;

/// Global meter for remotedialer metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("remotedialer"));

// ============================================================================
// Session Metrics
// ============================================================================

/// Counter of sessions registered with the session manager
///
/// Labels:
/// - `client_key`: client identity
/// - `peer`: true, false
pub static SESSIONS_ADDED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("remotedialer_sessions_added_total")
        .with_description("Total number of sessions added")
        .with_unit("{sessions}")
        .build()
});

/// Counter of sessions removed from the session manager
///
/// Labels:
/// - `client_key`: client identity
/// - `peer`: true, false
pub static SESSIONS_REMOVED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("remotedialer_sessions_removed_total")
        .with_description("Total number of sessions removed")
        .with_unit("{sessions}")
        .build()
});

// ============================================================================
// Connection Metrics
// ============================================================================

/// Counter of logical connections opened
///
/// Labels:
/// - `client_key`: client identity
pub static CONNECTIONS_ADDED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("remotedialer_connections_added_total")
        .with_description("Total number of multiplexed connections opened")
        .with_unit("{connections}")
        .build()
});

/// Counter of logical connections closed
///
/// Labels:
/// - `client_key`: client identity
pub static CONNECTIONS_REMOVED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("remotedialer_connections_removed_total")
        .with_description("Total number of multiplexed connections closed")
        .with_unit("{connections}")
        .build()
});

// ============================================================================
// Traffic Metrics
// ============================================================================

/// Counter of stream bytes written to a session
///
/// Labels:
/// - `client_key`: client identity
pub static TRANSMIT_BYTES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("remotedialer_transmit_bytes_total")
        .with_description("Total stream bytes sent through sessions")
        .with_unit("By")
        .build()
});

/// Counter of stream bytes read from a session
///
/// Labels:
/// - `client_key`: client identity
pub static RECEIVE_BYTES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("remotedialer_receive_bytes_total")
        .with_description("Total stream bytes received through sessions")
        .with_unit("By")
        .build()
});

/// Counter of messages written to a session
///
/// Labels:
/// - `client_key`: client identity
/// - `type`: message type
pub static TRANSMIT_MESSAGES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("remotedialer_transmit_messages_total")
        .with_description("Total protocol messages sent")
        .with_unit("{messages}")
        .build()
});

/// Counter of messages read from a session
///
/// Labels:
/// - `client_key`: client identity
/// - `type`: message type
pub static RECEIVE_MESSAGES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("remotedialer_receive_messages_total")
        .with_description("Total protocol messages received")
        .with_unit("{messages}")
        .build()
});

// ============================================================================
// Peer Metrics
// ============================================================================

/// Counter of peer link connect attempts
///
/// Labels:
/// - `peer`: peer id
pub static PEER_CONNECT_ATTEMPTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("remotedialer_peer_connect_attempts_total")
        .with_description("Total number of peer link connect attempts")
        .with_unit("{attempts}")
        .build()
});

/// Counter of successful peer link connects
///
/// Labels:
/// - `peer`: peer id
pub static PEER_CONNECTED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("remotedialer_peer_connected_total")
        .with_description("Total number of established peer links")
        .with_unit("{links}")
        .build()
});

// ============================================================================
// Helper Types
// ============================================================================

/// Direction of traffic through a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Written to the socket
    Transmit,
    /// Read from the socket
    Receive,
}

impl Direction {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transmit => "transmit",
            Self::Receive => "receive",
        }
    }
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record a session being added or removed
pub fn record_session(client_key: &str, peer: bool, added: bool) {
    let labels = [
        KeyValue::new("client_key", client_key.to_string()),
        KeyValue::new("peer", peer),
    ];
    if added {
        SESSIONS_ADDED.add(1, &labels);
    } else {
        SESSIONS_REMOVED.add(1, &labels);
    }
}

/// Record a logical connection being opened or closed
pub fn record_connection(client_key: &str, added: bool) {
    let labels = [KeyValue::new("client_key", client_key.to_string())];
    if added {
        CONNECTIONS_ADDED.add(1, &labels);
    } else {
        CONNECTIONS_REMOVED.add(1, &labels);
    }
}

/// Record one message and its stream bytes crossing a session
pub fn record_message(client_key: &str, direction: Direction, kind: &str, data_len: usize) {
    let key = KeyValue::new("client_key", client_key.to_string());
    let (messages, bytes) = match direction {
        Direction::Transmit => (&*TRANSMIT_MESSAGES, &*TRANSMIT_BYTES),
        Direction::Receive => (&*RECEIVE_MESSAGES, &*RECEIVE_BYTES),
    };
    messages.add(1, &[key.clone(), KeyValue::new("type", kind.to_string())]);
    if data_len > 0 {
        bytes.add(data_len as u64, &[key]);
    }
}

/// Record a peer link connect attempt and whether it succeeded
pub fn record_peer_connect(peer: &str, connected: bool) {
    let labels = [KeyValue::new("peer", peer.to_string())];
    PEER_CONNECT_ATTEMPTS.add(1, &labels);
    if connected {
        PEER_CONNECTED.add(1, &labels);
    }
}
