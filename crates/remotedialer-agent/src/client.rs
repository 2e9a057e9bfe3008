//! Outbound connection from the agent to its server
//!
//! The agent dials out, upgrades to a WebSocket and then serves Connects
//! the server sends down that socket. [`Agent::run`] keeps the connection up,
//! retrying on a fixed interval until cancelled.

use std::sync::Arc;

use remotedialer_core::{connect_websocket, ConnectHandler, ConnectOptions, Session, SessionRole};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::dial::LocalDialer;
use crate::error::AgentError;

/// Invoked once per established session, before it starts serving
pub type OnConnect = Arc<dyn Fn(&Session) + Send + Sync>;

/// Connect once and serve until the session ends
///
/// Returns `Ok(())` when `cancel` fires, otherwise the error that ended the
/// attempt.
pub async fn connect_to_server(
    config: &AgentConfig,
    handler: Arc<dyn ConnectHandler>,
    on_connect: Option<&OnConnect>,
    cancel: &CancellationToken,
) -> Result<(), AgentError> {
    if config.client_key.is_empty() {
        return Err(AgentError::Config("client key must not be empty".to_string()));
    }

    let options = ConnectOptions {
        url: config.server_url.clone(),
        headers: config.request_headers(),
        insecure_skip_verify: config.insecure_skip_verify,
        handshake_timeout: config.handshake_timeout,
        idle_timeout: config.session.idle_timeout,
    };
    let wire = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(()),
        wire = connect_websocket(&options) => wire?,
    };

    let session = Session::builder(config.client_key.as_str(), SessionRole::Client)
        .config(config.session.clone())
        .handler(handler)
        .build(wire);
    info!(
        server = %config.server_url,
        client_key = %config.client_key,
        "connected to tunnel server"
    );

    if let Some(on_connect) = on_connect {
        on_connect(&session);
    }

    session.serve(cancel.child_token()).await?;
    Ok(())
}

/// Long-running agent
pub struct Agent {
    config: AgentConfig,
    handler: Arc<dyn ConnectHandler>,
    on_connect: Option<OnConnect>,
}

impl Agent {
    /// Agent dialing only what `config.allow` permits
    pub fn new(config: AgentConfig) -> Self {
        let handler = Arc::new(LocalDialer::new(config.allow.clone()));
        Self::with_handler(config, handler)
    }

    /// Agent with a custom accept path
    pub fn with_handler(config: AgentConfig, handler: Arc<dyn ConnectHandler>) -> Self {
        Self {
            config,
            handler,
            on_connect: None,
        }
    }

    /// Run `callback` on each new session
    pub fn on_connect(mut self, callback: OnConnect) -> Self {
        self.on_connect = Some(callback);
        self
    }

    /// Agent configuration
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Stay connected until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            server = %self.config.server_url,
            client_key = %self.config.client_key,
            allow = %self.config.allow,
            "agent starting"
        );

        while !cancel.is_cancelled() {
            let result = connect_to_server(
                &self.config,
                self.handler.clone(),
                self.on_connect.as_ref(),
                &cancel,
            )
            .await;

            match result {
                Ok(()) => info!("tunnel session closed"),
                Err(e) => warn!(
                    error = %e,
                    retry_in = ?self.config.reconnect_interval,
                    "tunnel connection lost"
                ),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
        }
        info!("agent stopped");
    }
}
