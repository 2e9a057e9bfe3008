//! Server configuration

use std::net::SocketAddr;
use std::time::Duration;

use remotedialer_common::{env_secs, DEFAULT_SERVER_PORT};
use remotedialer_core::SessionConfig;

/// Default delay between peer link reconnect attempts
pub const DEFAULT_PEER_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Default bound on a peer link's TCP + TLS + WebSocket handshake
pub const DEFAULT_PEER_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the upgrade endpoint
    pub listen_addr: SocketAddr,
    /// This server's id when federating; peers see it in `X-API-Tunnel-ID`
    pub peer_id: Option<String>,
    /// Fleet token presented to and expected from peer servers
    pub peer_token: Option<String>,
    /// Fixed delay between peer link reconnect attempts
    pub peer_reconnect_interval: Duration,
    /// Bound on establishing a peer link
    pub peer_handshake_timeout: Duration,
    /// Skip certificate verification on `wss://` peer links
    pub peer_insecure_skip_verify: bool,
    /// Tuning for every session this server serves
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_SERVER_PORT)),
            peer_id: None,
            peer_token: None,
            peer_reconnect_interval: env_secs(
                "REMOTEDIALER_PEER_RECONNECT_SECS",
                DEFAULT_PEER_RECONNECT_INTERVAL,
            ),
            peer_handshake_timeout: DEFAULT_PEER_HANDSHAKE_TIMEOUT,
            peer_insecure_skip_verify: true,
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Own peer credentials, when both are configured
    pub fn peer_credentials(&self) -> Option<(&str, &str)> {
        match (self.peer_id.as_deref(), self.peer_token.as_deref()) {
            (Some(id), Some(token)) if !id.is_empty() && !token.is_empty() => Some((id, token)),
            _ => None,
        }
    }
}
