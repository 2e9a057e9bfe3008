//! Tunnel server for remotedialer
//!
//! Agents connect outbound to `GET /connect` and upgrade to a WebSocket.
//! The server authenticates them, registers a session per socket and hands
//! out [`remotedialer_core::Dialer`]s so the rest of the process can open
//! streams *into* the agents.
//!
//! # Federation
//!
//! Servers of one fleet link to each other ([`Server::add_peer`]). Each link
//! announces the linking server's direct clients to the target, so a dial
//! for a client connected elsewhere in the fleet is relayed through one hop.
//!
//! ```text
//!   caller ──▶ server A ══ peer session ══▶ server B ══ client session ══▶ agent
//!              (network "edge-1::tcp")        (PeerDialer strips the prefix)
//! ```

#![deny(missing_docs)]

pub mod auth;
pub mod config;
pub mod error;
pub mod peer;
mod server;

pub use auth::{default_error_writer, Authorizer, ErrorWriter, HeaderAuthorizer};
pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use peer::{PeerDialer, PeerLink};
pub use server::Server;
