//! Data plane of the remotedialer reverse tunnel.
//!
//! A [`Session`] owns one WebSocket ([`WireConnection`]) and multiplexes
//! many [`StreamConnection`]s over it. Each stream has a bounded
//! [`FlowBuffer`] and a [`BackPressure`] gate so one slow reader can pause
//! its own remote writer without stalling the rest of the socket.
//!
//! [`SessionManager`] maps client identities to sessions and resolves a
//! [`Dialer`] for any identity reachable directly or through a peer server.

#![deny(missing_docs)]

mod backpressure;
mod config;
mod connect;
mod connection;
mod dialer;
mod error;
mod flow;
mod io;
mod manager;
mod session;
mod wire;

pub use backpressure::BackPressure;
pub use config::{SessionConfig, DEFAULT_HIGH_WATERMARK, DEFAULT_LOW_WATERMARK, DEFAULT_MAX_CHUNK};
pub use connect::{connect_websocket, ConnectError, ConnectOptions};
pub use connection::{MessageSink, StreamConnection};
pub use dialer::Dialer;
pub use error::TunnelError;
pub use flow::{FlowBuffer, FlowStatus, WatermarkListener};
pub use io::TunnelStream;
pub use manager::SessionManager;
pub use session::{AsyncIo, ConnectHandler, Session, SessionBuilder, SessionRole};
pub use wire::{WireConnection, WireFrame};
