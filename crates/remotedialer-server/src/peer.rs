//! Federation links to other servers of the same fleet
//!
//! # Link lifecycle
//!
//! ```text
//! connect (own id/token headers) ──▶ client-role Session
//!        ▲                              │ registered as a listener:
//!        │                              │ our direct clients are announced
//!        │ fixed interval               │ Connects from the peer are served
//!        │                              ▼ by PeerDialer
//!        └──────────── socket fails ◀── serve
//! ```
//!
//! The peer keeps the inbound side of this socket as a peer session, so it
//! can dial any client we announce. Reachability in the other direction
//! comes from the peer's own link to us.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use remotedialer_common::{metrics, PEER_ID_HEADER, PEER_TOKEN_HEADER};
use remotedialer_core::{
    connect_websocket, AsyncIo, ConnectHandler, ConnectOptions, Session, SessionConfig,
    SessionManager, SessionRole, TunnelError,
};
use remotedialer_proto::split_federated_network;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Serves Connects arriving over a peer link by dialing our own clients
///
/// The network carries the target identity (`"<client_key>::tcp"`). Only
/// directly connected clients are dialed so a stale announcement can never
/// bounce a Connect back across the mesh.
pub struct PeerDialer {
    sessions: Arc<SessionManager>,
}

impl PeerDialer {
    /// Dial through `sessions`
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl ConnectHandler for PeerDialer {
    fn allow(&self, proto: &str, _address: &str) -> bool {
        split_federated_network(proto).is_some()
    }

    async fn dial(&self, proto: &str, address: &str) -> std::result::Result<Box<dyn AsyncIo>, TunnelError> {
        let (client_key, proto) = split_federated_network(proto)
            .ok_or_else(|| TunnelError::InvalidNetwork(proto.to_string()))?;
        let dialer = self.sessions.get_dialer(client_key)?;
        if dialer.is_federated() {
            return Err(TunnelError::NoSession(client_key.to_string()));
        }
        let stream = dialer.dial(proto, address).await?;
        Ok(Box::new(stream))
    }
}

/// One configured federation target and the task keeping it connected
#[derive(Debug)]
pub struct PeerLink {
    url: String,
    id: String,
    token: String,
    cancel: CancellationToken,
}

/// Everything a link task needs besides its target
#[derive(Clone)]
pub(crate) struct LinkContext {
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) own_id: String,
    pub(crate) own_token: String,
    pub(crate) reconnect_interval: Duration,
    pub(crate) handshake_timeout: Duration,
    pub(crate) insecure_skip_verify: bool,
    pub(crate) session: SessionConfig,
}

impl PeerLink {
    /// Spawn the reconnect loop for `url`
    pub(crate) fn start(
        url: String,
        id: String,
        token: String,
        ctx: LinkContext,
        cancel: CancellationToken,
    ) -> Self {
        let link = Self {
            url,
            id,
            token,
            cancel,
        };
        tokio::spawn(run_link(
            link.url.clone(),
            link.id.clone(),
            ctx,
            link.cancel.clone(),
        ));
        link
    }

    /// Peer id this link targets
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Upgrade URL of the peer
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether this link already targets exactly `(url, id, token)`
    pub fn matches(&self, url: &str, id: &str, token: &str) -> bool {
        self.url == url && self.id == id && self.token == token
    }

    /// Whether `token` is the credential this link was configured with
    pub fn accepts_token(&self, token: &str) -> bool {
        self.token == token
    }

    /// Stop the link; the live session, if any, is torn down
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the link has been stopped
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

async fn run_link(url: String, id: String, ctx: LinkContext, cancel: CancellationToken) {
    info!(peer = %id, %url, "peer link started");
    while !cancel.is_cancelled() {
        match connect_once(&url, &id, &ctx, &cancel).await {
            Ok(()) => debug!(peer = %id, "peer link session ended"),
            Err(e) => warn!(peer = %id, %url, error = %e, "peer link failed"),
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(ctx.reconnect_interval) => {}
        }
    }
    info!(peer = %id, "peer link stopped");
}

async fn connect_once(
    url: &str,
    id: &str,
    ctx: &LinkContext,
    cancel: &CancellationToken,
) -> Result<()> {
    let options = ConnectOptions {
        url: url.to_string(),
        headers: vec![
            (PEER_ID_HEADER.to_string(), ctx.own_id.clone()),
            (PEER_TOKEN_HEADER.to_string(), ctx.own_token.clone()),
        ],
        insecure_skip_verify: ctx.insecure_skip_verify,
        handshake_timeout: ctx.handshake_timeout,
        idle_timeout: ctx.session.idle_timeout,
    };

    let connected = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        connected = connect_websocket(&options) => connected,
    };
    metrics::record_peer_connect(id, connected.is_ok());
    let wire = connected?;

    let session = Session::builder(id, SessionRole::Client)
        .config(ctx.session.clone())
        .handler(Arc::new(PeerDialer::new(ctx.sessions.clone())))
        .build(wire);
    info!(peer = %id, session_key = session.session_key(), "peer link connected");

    ctx.sessions.add_listener(session.clone());
    let result = session.serve(cancel.child_token()).await;
    ctx.sessions.remove_listener(&session);
    result.map_err(Into::into)
}
