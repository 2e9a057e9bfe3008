//! Agent configuration

use std::time::Duration;

use remotedialer_common::{env_secs, CLIENT_ID_HEADER};
use remotedialer_core::SessionConfig;

use crate::dial::AllowList;

/// Default delay between reconnect attempts
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Default bound on the connect + upgrade handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How an agent reaches its server and what it lets the server dial
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// `ws://` or `wss://` URL of the server's upgrade endpoint
    pub server_url: String,
    /// Identity the agent registers under
    pub client_key: String,
    /// Bearer token presented to the server
    pub token: Option<String>,
    /// Additional request headers
    pub headers: Vec<(String, String)>,
    /// Fixed delay between reconnect attempts
    pub reconnect_interval: Duration,
    /// Bound on the connect + upgrade handshake
    pub handshake_timeout: Duration,
    /// Accept any server certificate on `wss://`
    pub insecure_skip_verify: bool,
    /// Targets the server may ask the agent to dial
    pub allow: AllowList,
    /// Session tuning
    pub session: SessionConfig,
}

impl AgentConfig {
    /// Config for `client_key` connecting to `server_url`, everything else default
    pub fn new(server_url: impl Into<String>, client_key: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            client_key: client_key.into(),
            token: None,
            headers: Vec::new(),
            reconnect_interval: env_secs(
                "REMOTEDIALER_RECONNECT_SECS",
                DEFAULT_RECONNECT_INTERVAL,
            ),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            insecure_skip_verify: false,
            allow: AllowList::default(),
            session: SessionConfig::default(),
        }
    }

    /// Every header sent on the upgrade request
    pub fn request_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![(CLIENT_ID_HEADER.to_string(), self.client_key.clone())];
        if let Some(token) = &self.token {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }
        headers.extend(self.headers.iter().cloned());
        headers
    }
}
