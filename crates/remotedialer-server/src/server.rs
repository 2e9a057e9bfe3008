//! Tunnel server: upgrade endpoint, session registry and peer links

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use remotedialer_common::{DEFAULT_CONNECT_PATH, PEER_ID_HEADER, PEER_TOKEN_HEADER};
use remotedialer_core::{Dialer, Session, SessionManager, SessionRole, TunnelError, WireConnection};
use remotedialer_proto::MAX_CONTROL_PAYLOAD;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{default_error_writer, header_str, Authorizer, ErrorWriter};
use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::peer::{LinkContext, PeerLink};

/// Reverse-tunnel server
///
/// Cheap to clone; all clones share one session registry.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    sessions: Arc<SessionManager>,
    authorizer: Arc<dyn Authorizer>,
    error_writer: ErrorWriter,
    peers: Mutex<HashMap<String, PeerLink>>,
    cancel: CancellationToken,
}

impl Server {
    /// Create a server that renders rejections with [`default_error_writer`]
    pub fn new(config: ServerConfig, authorizer: Arc<dyn Authorizer>) -> Self {
        Self::with_error_writer(config, authorizer, default_error_writer())
    }

    /// Create a server with a custom rejection renderer
    pub fn with_error_writer(
        config: ServerConfig,
        authorizer: Arc<dyn Authorizer>,
        error_writer: ErrorWriter,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                sessions: Arc::new(SessionManager::new()),
                authorizer,
                error_writer,
                peers: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Registry of every session this server serves
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.inner.sessions
    }

    /// HTTP routes: the upgrade endpoint and a health check
    pub fn router(&self) -> Router {
        Router::new()
            .route(DEFAULT_CONNECT_PATH, get(connect_handler))
            .route("/healthz", get(|| async { "ok" }))
            .with_state(self.clone())
    }

    /// Serve the router on `listener` until [`Server::shutdown`]
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr = listener
            .local_addr()
            .map_err(|e| ServerError::Config(e.to_string()))?;
        info!(%addr, path = DEFAULT_CONNECT_PATH, "tunnel server listening");

        let cancel = self.inner.cancel.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| ServerError::Config(format!("server error: {e}")))
    }

    /// Stop peer links and every served session
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        for (_, link) in self.peers().drain() {
            link.cancel();
        }
    }

    /// Dialer reaching `client_key`, directly or through a peer
    pub fn dialer(&self, client_key: &str) -> std::result::Result<Dialer, TunnelError> {
        self.inner.sessions.get_dialer(client_key)
    }

    /// Whether `client_key` is reachable
    pub fn has_session(&self, client_key: &str) -> bool {
        self.inner.sessions.has_session(client_key)
    }

    /// Directly connected client identities, sorted
    pub fn list_clients(&self) -> Vec<String> {
        self.inner.sessions.list_clients()
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<String, PeerLink>> {
        self.inner.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Keep a federation link to the server at `url`
    ///
    /// Re-adding the same `(url, id, token)` is a no-op; anything else
    /// registered under `id` is replaced. Ignored unless this server has its
    /// own peer id and token.
    pub fn add_peer(&self, url: &str, id: &str, token: &str) {
        let Some((own_id, own_token)) = self.inner.config.peer_credentials() else {
            warn!(peer = %id, "peer ignored: no own peer id/token configured");
            return;
        };

        let mut peers = self.peers();
        if let Some(existing) = peers.get(id) {
            if existing.matches(url, id, token) {
                debug!(peer = %id, "peer already linked");
                return;
            }
            info!(peer = %id, old_url = %existing.url(), %url, "replacing peer link");
            existing.cancel();
        }

        let config = &self.inner.config;
        let ctx = LinkContext {
            sessions: self.inner.sessions.clone(),
            own_id: own_id.to_string(),
            own_token: own_token.to_string(),
            reconnect_interval: config.peer_reconnect_interval,
            handshake_timeout: config.peer_handshake_timeout,
            insecure_skip_verify: config.peer_insecure_skip_verify,
            session: config.session.clone(),
        };
        let link = PeerLink::start(
            url.to_string(),
            id.to_string(),
            token.to_string(),
            ctx,
            self.inner.cancel.child_token(),
        );
        peers.insert(id.to_string(), link);
    }

    /// Drop the federation link registered under `id`
    pub fn remove_peer(&self, id: &str) {
        if let Some(link) = self.peers().remove(id) {
            info!(peer = %id, "removing peer link");
            link.cancel();
        }
    }

    /// Ids of configured peer links, sorted
    pub fn list_peer_links(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether the request carries valid peer server credentials
    ///
    /// Only ids with a configured link are accepted, and only with that
    /// link's token.
    fn peer_identity(&self, headers: &HeaderMap) -> Option<String> {
        let id = header_str(headers, PEER_ID_HEADER)?;
        let token = header_str(headers, PEER_TOKEN_HEADER)?;

        self.peers()
            .get(id)
            .is_some_and(|link| link.accepts_token(token))
            .then(|| id.to_string())
    }

    /// Resolve `(client_key, is_peer)` for an upgrade request
    async fn authorize(&self, headers: &HeaderMap) -> Result<(String, bool)> {
        if let Some(peer) = self.peer_identity(headers) {
            return Ok((peer, true));
        }

        match self.inner.authorizer.authorize(headers).await {
            Ok(Some(client_key)) if client_key.len() > MAX_CONTROL_PAYLOAD => {
                Err(ServerError::AuthFailed(format!(
                    "client id is {} bytes, limit is {MAX_CONTROL_PAYLOAD}",
                    client_key.len()
                )))
            }
            Ok(Some(client_key)) => Ok((client_key, false)),
            Ok(None) => Err(ServerError::Unauthorized("failed authentication".to_string())),
            Err(ServerError::Unauthorized(reason)) => Err(ServerError::Unauthorized(reason)),
            Err(e) => Err(ServerError::AuthFailed(e.to_string())),
        }
    }

    async fn serve_socket(self, socket: WebSocket, client_key: String, peer: bool) {
        let config = &self.inner.config.session;
        let wire = WireConnection::from_axum(socket, config.idle_timeout);
        let session = Session::builder(client_key.as_str(), SessionRole::Server)
            .peer(peer)
            .config(config.clone())
            .build(wire);

        let result = self
            .inner
            .sessions
            .serve(session, self.inner.cancel.child_token())
            .await;
        match result {
            Ok(()) => debug!(client_key = %client_key, peer, "session stopped"),
            Err(e) => debug!(client_key = %client_key, peer, error = %e, "session ended"),
        }
    }
}

async fn connect_handler(
    State(server): State<Server>,
    headers: HeaderMap,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let (client_key, peer) = match server.authorize(&headers).await {
        Ok(found) => found,
        Err(e) => {
            info!(error = %e, "tunnel connect rejected");
            return (server.inner.error_writer)(e);
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            let err = ServerError::Upgrade(rejection.to_string());
            return (server.inner.error_writer)(err);
        }
    };

    debug!(client_key = %client_key, peer, "upgrading tunnel connect");
    ws.on_upgrade(move |socket| server.serve_socket(socket, client_key, peer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MockAuthorizer;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::IntoResponse;
    use tower::ServiceExt;

    fn server_with(authorizer: MockAuthorizer, config: ServerConfig) -> Server {
        Server::new(config, Arc::new(authorizer))
    }

    fn fleet_config() -> ServerConfig {
        ServerConfig {
            peer_id: Some("a".into()),
            peer_token: Some("fleet".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_healthz() {
        let server = server_with(MockAuthorizer::new(), ServerConfig::default());
        let response = server
            .router()
            .oneshot(Request::get("/healthz").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rejected_connect_is_unauthorized() {
        let mut auth = MockAuthorizer::new();
        auth.expect_authorize().times(1).returning(|_| Ok(None));
        let server = server_with(auth, ServerConfig::default());

        let response = server
            .router()
            .oneshot(Request::get("/connect").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_authorizer_error_is_bad_request() {
        let mut auth = MockAuthorizer::new();
        auth.expect_authorize()
            .returning(|_| Err(ServerError::Config("backend down".into())));
        let server = server_with(auth, ServerConfig::default());

        let response = server
            .router()
            .oneshot(Request::get("/connect").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_authorized_non_upgrade_request_is_bad_request() {
        let mut auth = MockAuthorizer::new();
        auth.expect_authorize()
            .returning(|_| Ok(Some("edge-1".to_string())));
        let server = server_with(auth, ServerConfig::default());

        let response = server
            .router()
            .oneshot(Request::get("/connect").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_custom_error_writer() {
        let mut auth = MockAuthorizer::new();
        auth.expect_authorize().returning(|_| Ok(None));
        let writer: ErrorWriter =
            Arc::new(|_err| (StatusCode::IM_A_TEAPOT, "nope").into_response());
        let server = Server::with_error_writer(ServerConfig::default(), Arc::new(auth), writer);

        let response = server
            .router()
            .oneshot(Request::get("/connect").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    }

    #[tokio::test]
    async fn test_peer_headers_bypass_authorizer() {
        // No expectation set: calling the authorizer would panic.
        let server = server_with(MockAuthorizer::new(), fleet_config());
        server.add_peer("ws://127.0.0.1:1/connect", "b", "fleet");

        let mut headers = HeaderMap::new();
        headers.insert(PEER_ID_HEADER, "b".parse().expect("header"));
        headers.insert(PEER_TOKEN_HEADER, "fleet".parse().expect("header"));
        let (key, peer) = server.authorize(&headers).await.expect("peer accepted");
        assert_eq!(key, "b");
        assert!(peer);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_peer_id_with_fleet_token_is_unauthorized() {
        let mut auth = MockAuthorizer::new();
        auth.expect_authorize().times(1).returning(|_| Ok(None));
        let server = server_with(auth, fleet_config());
        server.add_peer("ws://127.0.0.1:1/connect", "b", "fleet");

        let request = Request::get("/connect")
            .header(PEER_ID_HEADER, "mallory")
            .header(PEER_TOKEN_HEADER, "fleet")
            .body(Body::empty())
            .expect("request");
        let response = server.router().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(!server.has_session("mallory"));
        server.shutdown();
    }

    #[tokio::test]
    async fn test_overlong_client_id_is_refused() {
        let mut auth = MockAuthorizer::new();
        auth.expect_authorize()
            .returning(|_| Ok(Some("x".repeat(MAX_CONTROL_PAYLOAD + 1))));
        let server = server_with(auth, ServerConfig::default());

        let result = server.authorize(&HeaderMap::new()).await;
        assert!(matches!(result, Err(ServerError::AuthFailed(_))));

        let response = server
            .router()
            .oneshot(Request::get("/connect").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_wrong_peer_token_falls_through_to_authorizer() {
        let mut auth = MockAuthorizer::new();
        auth.expect_authorize().times(1).returning(|_| Ok(None));
        let server = server_with(auth, fleet_config());

        let mut headers = HeaderMap::new();
        headers.insert(PEER_ID_HEADER, "b".parse().expect("header"));
        headers.insert(PEER_TOKEN_HEADER, "guess".parse().expect("header"));
        assert!(matches!(
            server.authorize(&headers).await,
            Err(ServerError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_add_peer_ignored_without_own_credentials() {
        let server = server_with(MockAuthorizer::new(), ServerConfig::default());
        server.add_peer("ws://127.0.0.1:1/connect", "b", "fleet");
        assert!(server.list_peer_links().is_empty());
    }

    // Story: peer links are reconciled by (url, id, token)
    #[tokio::test]
    async fn story_peer_links_reconcile() {
        let server = server_with(MockAuthorizer::new(), fleet_config());

        // Act 1: first add starts a link
        server.add_peer("ws://127.0.0.1:1/connect", "b", "fleet");
        assert_eq!(server.list_peer_links(), vec!["b".to_string()]);

        // Act 2: same triple is a no-op, a changed url replaces the link
        server.add_peer("ws://127.0.0.1:1/connect", "b", "fleet");
        server.add_peer("ws://127.0.0.1:2/connect", "b", "fleet");
        assert_eq!(server.list_peer_links(), vec!["b".to_string()]);
        assert_eq!(
            server.peers().get("b").map(|l| l.url().to_string()),
            Some("ws://127.0.0.1:2/connect".to_string())
        );

        // Act 3: removal and shutdown clear everything
        server.add_peer("ws://127.0.0.1:3/connect", "c", "fleet");
        server.remove_peer("b");
        assert_eq!(server.list_peer_links(), vec!["c".to_string()]);
        server.shutdown();
        assert!(server.list_peer_links().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_client_has_no_dialer() {
        let server = server_with(MockAuthorizer::new(), ServerConfig::default());
        assert!(!server.has_session("edge-1"));
        assert!(matches!(
            server.dialer("edge-1"),
            Err(TunnelError::NoSession(_))
        ));
        assert!(server.list_clients().is_empty());
    }
}
