//! One physical socket and the logical streams multiplexed over it
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────── Session ────────────────┐
//!   dial path ───▶│ server_connect ──▶ Connect ──┐          │
//!                 │                              ▼          │
//!   StreamConn ──▶│ write_message ─────▶ WireConnection ────┼──▶ socket
//!                 │   (write lock)          ▲               │
//!   announcements▶│ announcer task ─────────┘               │
//!                 │                                         │
//!   socket ──────▶│ read loop ──▶ serve_message             │
//!                 │    Data/Error/Pause/Resume ─▶ conns[id] │
//!                 │    Connect ─▶ ConnectHandler (accept)   │
//!                 │    AddClient/RemoveClient ─▶ remote keys│
//!                 └─────────────────────────────────────────┘
//! ```
//!
//! # Roles
//!
//! A [`SessionRole::Client`] session dialed the socket (agent, or the
//! outbound side of a peer link) and sends keep-alive pings. A
//! [`SessionRole::Server`] session accepted it. Either side may carry a
//! [`ConnectHandler`] to accept inbound Connects; without one every Connect
//! is refused with an Error message.
//!
//! # Teardown
//!
//! The read loop ends on the first socket or framing error, or on
//! cancellation. Every live stream is then closed with that error
//! ([`TunnelError::ClosedPipe`] for cancellation) and the table emptied.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use remotedialer_common::metrics::{self, Direction};
use remotedialer_proto::{Message, Payload};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::connection::MessageSink;
use crate::{SessionConfig, StreamConnection, TunnelError, TunnelStream, WireConnection};

/// A locally dialed byte stream the accept path pipes a tunnel stream into
pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncIo for T {}

/// Accept path for inbound Connect messages
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectHandler: Send + Sync {
    /// Whether a Connect to `proto/address` may be served
    fn allow(&self, proto: &str, address: &str) -> bool;

    /// Dial the local target
    async fn dial(&self, proto: &str, address: &str) -> Result<Box<dyn AsyncIo>, TunnelError>;
}

/// Which end of the socket this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Dialed the socket; sends keep-alive pings
    Client,
    /// Accepted the socket
    Server,
}

/// Builder for [`Session`]
pub struct SessionBuilder {
    client_key: String,
    role: SessionRole,
    peer: bool,
    config: SessionConfig,
    handler: Option<Arc<dyn ConnectHandler>>,
}

impl SessionBuilder {
    /// Mark the session as a server-to-server federation link
    pub fn peer(mut self, peer: bool) -> Self {
        self.peer = peer;
        self
    }

    /// Override the session tuning
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config.normalized();
        self
    }

    /// Accept inbound Connects through `handler`
    pub fn handler(mut self, handler: Arc<dyn ConnectHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Bind the session to its socket
    pub fn build(self, wire: WireConnection) -> Session {
        let (announce_tx, announce_rx) = mpsc::unbounded_channel();
        Session {
            inner: Arc::new(SessionInner {
                client_key: self.client_key,
                session_key: rand::thread_rng().gen_range(1..i64::MAX),
                role: self.role,
                peer: self.peer,
                wire,
                config: self.config,
                conns: DashMap::new(),
                remote_client_keys: Mutex::new(HashMap::new()),
                next_conn_id: AtomicI64::new(0),
                handler: self.handler,
                announce_tx,
                announce_rx: Mutex::new(Some(announce_rx)),
                cancel: CancellationToken::new(),
            }),
        }
    }
}

/// A multiplexed tunnel socket
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    client_key: String,
    session_key: i64,
    role: SessionRole,
    peer: bool,
    wire: WireConnection,
    config: SessionConfig,
    conns: DashMap<i64, Arc<StreamConnection>>,
    remote_client_keys: Mutex<HashMap<String, HashSet<i64>>>,
    next_conn_id: AtomicI64,
    handler: Option<Arc<dyn ConnectHandler>>,
    announce_tx: mpsc::UnboundedSender<Message>,
    announce_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    cancel: CancellationToken,
}

impl Session {
    /// Start building a session for `client_key`
    pub fn builder(client_key: impl Into<String>, role: SessionRole) -> SessionBuilder {
        SessionBuilder {
            client_key: client_key.into(),
            role,
            peer: false,
            config: SessionConfig::default(),
            handler: None,
        }
    }

    /// Identity this session is registered under
    pub fn client_key(&self) -> &str {
        &self.inner.client_key
    }

    /// Random id naming this session in AddClient/RemoveClient announcements
    pub fn session_key(&self) -> i64 {
        self.inner.session_key
    }

    /// Which end of the socket this is
    pub fn role(&self) -> SessionRole {
        self.inner.role
    }

    /// Whether this is a federation link to another server
    pub fn is_peer(&self) -> bool {
        self.inner.peer
    }

    /// Session tuning
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Live stream count
    pub fn connection_count(&self) -> usize {
        self.inner.conns.len()
    }

    /// Whether the session has been torn down or asked to stop
    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Stop serving; the read loop tears everything down
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    /// Whether two handles refer to the same session
    pub fn same_session(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run the read loop until the socket fails or `cancel` fires
    ///
    /// Returns `Ok(())` when stopped by cancellation, otherwise the error
    /// that ended the session.
    pub async fn serve(&self, cancel: CancellationToken) -> Result<(), TunnelError> {
        let inner = &self.inner;
        info!(
            client_key = %inner.client_key,
            session_key = inner.session_key,
            peer = inner.peer,
            role = ?inner.role,
            "session started"
        );

        let background = inner.cancel.child_token();
        let announce_rx = inner
            .announce_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(rx) = announce_rx {
            tokio::spawn(run_announcer(inner.clone(), rx, background.clone()));
        }
        if inner.role == SessionRole::Client {
            tokio::spawn(run_pinger(inner.clone(), background.clone()));
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            _ = inner.cancel.cancelled() => Ok(()),
            err = self.read_loop() => Err(err),
        };

        let stream_err = match &result {
            Ok(()) => TunnelError::ClosedPipe,
            Err(err) => err.clone(),
        };
        self.teardown(stream_err).await;

        match &result {
            Ok(()) => info!(client_key = %inner.client_key, session_key = inner.session_key, "session closed"),
            Err(err) => info!(client_key = %inner.client_key, session_key = inner.session_key, error = %err, "session ended"),
        }
        result
    }

    async fn read_loop(&self) -> TunnelError {
        loop {
            let message = match self.inner.wire.next_message().await {
                Ok(message) => message,
                Err(err) => return err,
            };
            metrics::record_message(
                &self.inner.client_key,
                Direction::Receive,
                message.message_type().map_or("unknown", |t| t.as_str()),
                message.data_len(),
            );
            self.serve_message(message).await;
        }
    }

    async fn serve_message(&self, message: Message) {
        let inner = &self.inner;
        trace!(client_key = %inner.client_key, message = %message, "received");
        let conn_id = message.conn_id;

        match message.payload {
            Payload::Connect { proto, address } => self.accept(conn_id, proto, address).await,
            Payload::Data(bytes) => {
                let conn = inner.conns.get(&conn_id).map(|c| c.value().clone());
                match conn {
                    Some(conn) => {
                        if let Err(err) = conn.on_data(bytes).await {
                            debug!(conn_id, error = %err, "data for closing connection dropped");
                        }
                    }
                    None => trace!(conn_id, "data for unknown connection ignored"),
                }
            }
            Payload::Error(remote) => {
                if let Some((_, conn)) = inner.conns.remove(&conn_id) {
                    metrics::record_connection(&inner.client_key, false);
                    conn.tunnel_close(TunnelError::from_remote(remote));
                }
            }
            Payload::Pause => {
                if let Some(conn) = inner.conns.get(&conn_id) {
                    conn.on_pause();
                }
            }
            Payload::Resume => {
                if let Some(conn) = inner.conns.get(&conn_id) {
                    conn.on_resume();
                }
            }
            Payload::AddClient(client_key) => self.add_remote_client(client_key, conn_id),
            Payload::RemoveClient(client_key) => self.remove_remote_client(&client_key, conn_id),
            Payload::Unknown { code, .. } => {
                debug!(client_key = %inner.client_key, code, "dropping message of unknown type");
            }
        }
    }

    async fn accept(&self, conn_id: i64, proto: String, address: String) {
        let inner = &self.inner;
        if inner.conns.contains_key(&conn_id) {
            warn!(client_key = %inner.client_key, conn_id, "duplicate connect ignored");
            return;
        }

        let handler = match &inner.handler {
            Some(handler) if handler.allow(&proto, &address) => handler.clone(),
            _ => {
                debug!(client_key = %inner.client_key, conn_id, %proto, %address, "connect not allowed");
                let err = TunnelError::ConnectNotAllowed { proto, address };
                let refusal = Message::error(conn_id, err.to_remote());
                if let Err(send_err) = inner.write_message(inner.config.write_timeout, refusal).await {
                    trace!(conn_id, error = %send_err, "connect refusal not sent");
                }
                return;
            }
        };

        let conn = Arc::new(StreamConnection::new(
            conn_id,
            proto.clone(),
            address.clone(),
            inner.clone(),
            &inner.config,
        ));
        inner.conns.insert(conn_id, conn.clone());
        metrics::record_connection(&inner.client_key, true);

        let inner = inner.clone();
        tokio::spawn(async move {
            let dialed =
                match tokio::time::timeout(inner.config.dial_timeout, handler.dial(&proto, &address)).await {
                    Ok(result) => result,
                    Err(_) => Err(TunnelError::Dial {
                        address: address.clone(),
                        reason: "timed out".to_string(),
                    }),
                };

            match dialed {
                Ok(mut local) => {
                    debug!(conn_id, %proto, %address, "connected to local target");
                    let mut tunnel = TunnelStream::new(conn.clone());
                    match tokio::io::copy_bidirectional(&mut tunnel, &mut local).await {
                        Ok(_) => conn.close().await,
                        Err(err) => {
                            debug!(conn_id, error = %err, "pipe failed");
                            conn.close_with_error(TunnelError::from(err)).await;
                        }
                    }
                }
                Err(err) => {
                    debug!(conn_id, %proto, %address, error = %err, "dial failed");
                    conn.tunnel_close(err.clone());
                    inner.close_connection(conn_id, Some(err)).await;
                }
            }
        });
    }

    /// Open a new logical stream to `proto/address` on the far side
    ///
    /// Returns as soon as the Connect message is written; a refused or failed
    /// connect surfaces as an error on the first read.
    pub async fn server_connect(
        &self,
        proto: &str,
        address: &str,
    ) -> Result<Arc<StreamConnection>, TunnelError> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(TunnelError::ClosedPipe);
        }

        let conn_id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn = Arc::new(StreamConnection::new(
            conn_id,
            proto,
            address,
            inner.clone(),
            &inner.config,
        ));
        inner.conns.insert(conn_id, conn.clone());
        metrics::record_connection(&inner.client_key, true);

        let message = Message::connect(conn_id, proto, address);
        if let Err(err) = inner.write_message(inner.config.write_timeout, message).await {
            if inner.conns.remove(&conn_id).is_some() {
                metrics::record_connection(&inner.client_key, false);
            }
            conn.tunnel_close(err.clone());
            return Err(err);
        }

        debug!(client_key = %inner.client_key, conn_id, %proto, %address, "connect sent");
        Ok(conn)
    }

    /// [`Session::server_connect`] wrapped for tokio I/O
    pub async fn dial(&self, proto: &str, address: &str) -> Result<TunnelStream, TunnelError> {
        Ok(TunnelStream::new(self.server_connect(proto, address).await?))
    }

    /// Queue a control message behind earlier announcements
    ///
    /// Announcements are written in order by the session's own task, so
    /// callers holding registry locks never wait on the socket.
    pub fn announce(&self, message: Message) {
        if self.inner.announce_tx.send(message).is_err() {
            trace!(client_key = %self.inner.client_key, "announcement after session end dropped");
        }
    }

    fn remote_keys(&self) -> MutexGuard<'_, HashMap<String, HashSet<i64>>> {
        self.inner
            .remote_client_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn add_remote_client(&self, client_key: String, session_key: i64) {
        debug!(peer = %self.inner.client_key, %client_key, session_key, "remote client added");
        self.remote_keys()
            .entry(client_key)
            .or_default()
            .insert(session_key);
    }

    pub(crate) fn remove_remote_client(&self, client_key: &str, session_key: i64) {
        debug!(peer = %self.inner.client_key, %client_key, session_key, "remote client removed");
        let mut keys = self.remote_keys();
        if let Some(sessions) = keys.get_mut(client_key) {
            sessions.remove(&session_key);
            if sessions.is_empty() {
                keys.remove(client_key);
            }
        }
    }

    /// Whether the far side announced it can reach `client_key`
    pub fn has_remote_client(&self, client_key: &str) -> bool {
        self.remote_keys().contains_key(client_key)
    }

    /// Client identities the far side announced, sorted
    pub fn remote_client_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.remote_keys().keys().cloned().collect();
        keys.sort();
        keys
    }

    async fn teardown(&self, err: TunnelError) {
        let inner = &self.inner;
        inner.cancel.cancel();

        let ids: Vec<i64> = inner.conns.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, conn)) = inner.conns.remove(&id) {
                metrics::record_connection(&inner.client_key, false);
                conn.tunnel_close(err.clone());
            }
        }
        self.remote_keys().clear();

        inner.wire.close(Duration::from_secs(1)).await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_key", &self.inner.client_key)
            .field("session_key", &self.inner.session_key)
            .field("role", &self.inner.role)
            .field("peer", &self.inner.peer)
            .field("connections", &self.inner.conns.len())
            .finish()
    }
}

#[async_trait]
impl MessageSink for SessionInner {
    async fn write_message(&self, deadline: Duration, message: Message) -> Result<(), TunnelError> {
        if self.cancel.is_cancelled() {
            return Err(TunnelError::ClosedPipe);
        }
        trace!(client_key = %self.client_key, message = %message, "sending");
        self.wire.write_message(&message, deadline).await?;
        metrics::record_message(
            &self.client_key,
            Direction::Transmit,
            message.message_type().map_or("unknown", |t| t.as_str()),
            message.data_len(),
        );
        Ok(())
    }

    async fn close_connection(&self, conn_id: i64, notify: Option<TunnelError>) {
        if self.conns.remove(&conn_id).is_some() {
            metrics::record_connection(&self.client_key, false);
        }
        if let Some(err) = notify {
            let message = Message::error(conn_id, err.to_remote());
            if let Err(send_err) = self.write_message(self.config.write_timeout, message).await {
                trace!(conn_id, error = %send_err, "close notification not sent");
            }
        }
    }
}

async fn run_announcer(
    inner: Arc<SessionInner>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return,
            message = rx.recv() => match message {
                Some(message) => message,
                None => return,
            },
        };
        match inner.write_message(inner.config.write_timeout, message).await {
            Ok(()) => {}
            Err(TunnelError::Framing(err)) => {
                warn!(client_key = %inner.client_key, error = %err, "announcement dropped");
            }
            Err(err) => {
                debug!(client_key = %inner.client_key, error = %err, "announcement not sent");
                return;
            }
        }
    }
}

async fn run_pinger(inner: Arc<SessionInner>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.config.ping_interval);
    // First tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(err) = inner.wire.ping(inner.config.write_timeout).await {
                    warn!(client_key = %inner.client_key, error = %err, "error writing ping");
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::wire::tests::pair;
    use crate::wire::WireFrame;
    use bytes::{Bytes, BytesMut};
    use remotedialer_proto::{put_varint, RemoteError};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    pub(crate) fn test_config() -> SessionConfig {
        SessionConfig {
            ping_interval: Duration::from_millis(50),
            idle_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(2),
            dial_timeout: Duration::from_secs(2),
            ..SessionConfig::default()
        }
    }

    pub(crate) async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    /// Accepts every Connect and echoes bytes back
    pub(crate) struct EchoHandler;

    #[async_trait]
    impl ConnectHandler for EchoHandler {
        fn allow(&self, _proto: &str, _address: &str) -> bool {
            true
        }

        async fn dial(&self, _proto: &str, _address: &str) -> Result<Box<dyn AsyncIo>, TunnelError> {
            let (local, mut remote) = tokio::io::duplex(64 * 1024);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match remote.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if remote.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
            Ok(Box::new(local))
        }
    }

    /// A served session and the raw socket on the other end
    async fn served_with_raw(
        role: SessionRole,
    ) -> (Session, WireConnection, CancellationToken) {
        let (local, raw) = pair(Duration::from_secs(5)).await;
        let session = Session::builder("agent-1", role)
            .config(test_config())
            .build(local);
        let cancel = CancellationToken::new();
        {
            let session = session.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { session.serve(cancel).await });
        }
        (session, raw, cancel)
    }

    #[tokio::test]
    async fn test_dial_sends_connect_and_reads_data_in_order() {
        let (session, raw, _cancel) = served_with_raw(SessionRole::Server).await;

        let conn = session
            .server_connect("tcp", "127.0.0.1:9")
            .await
            .expect("connect should be sent");

        let connect = raw.next_message().await.expect("read connect");
        assert_eq!(connect.conn_id, conn.conn_id());
        assert_eq!(
            connect.payload,
            Payload::Connect {
                proto: "tcp".into(),
                address: "127.0.0.1:9".into(),
            }
        );
        let frame = connect.encode().expect("encode");
        assert!(frame.ends_with(b"tcp/127.0.0.1:9"));

        for fill in [0xaau8, 0xbb] {
            raw.write_message(
                &Message::data(conn.conn_id(), Bytes::from(vec![fill; 4096])),
                Duration::from_secs(1),
            )
            .await
            .expect("write data");
        }

        let mut received = Vec::new();
        while received.len() < 8192 {
            let chunk = conn.read_chunk(3000).await.expect("read");
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received.len(), 8192);
        assert!(received[..4096].iter().all(|b| *b == 0xaa));
        assert!(received[4096..].iter().all(|b| *b == 0xbb));
    }

    #[tokio::test]
    async fn test_unknown_ids_and_types_are_ignored() {
        let (session, raw, _cancel) = served_with_raw(SessionRole::Server).await;
        let conn = session.server_connect("tcp", "10.0.0.1:80").await.expect("connect");
        let _ = raw.next_message().await.expect("connect");

        let timeout = Duration::from_secs(1);
        raw.write_message(&Message::data(999, Bytes::from_static(b"stray")), timeout)
            .await
            .expect("write");
        raw.write_message(&Message::error(998, RemoteError::Eof), timeout)
            .await
            .expect("write");
        raw.write_message(&Message::pause(997), timeout).await.expect("write");

        let mut unknown = BytesMut::new();
        put_varint(&mut unknown, 1);
        put_varint(&mut unknown, conn.conn_id());
        put_varint(&mut unknown, 42);
        unknown.extend_from_slice(b"from the future");
        raw.write_frame(WireFrame::Binary(unknown.freeze()), timeout)
            .await
            .expect("write");

        raw.write_message(&Message::data(conn.conn_id(), Bytes::from_static(b"ok")), timeout)
            .await
            .expect("write");

        assert_eq!(conn.read_chunk(16).await, Ok(Bytes::from_static(b"ok")));
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_connect_without_handler_is_refused() {
        let (session, raw, _cancel) = served_with_raw(SessionRole::Server).await;

        raw.write_message(&Message::connect(5, "tcp", "127.0.0.1:22"), Duration::from_secs(1))
            .await
            .expect("write connect");

        let reply = raw.next_message().await.expect("read reply");
        assert_eq!(reply.conn_id, 5);
        assert_eq!(
            reply.payload,
            Payload::Error(RemoteError::Message(
                "connect not allowed: tcp/127.0.0.1:22".into()
            ))
        );
        assert_eq!(session.connection_count(), 0);
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_disallowed_connect_is_refused() {
        let mut handler = MockConnectHandler::new();
        handler
            .expect_allow()
            .withf(|proto, address| {
                proto.to_string() == "tcp" && address.to_string() == "169.254.169.254:80"
            })
            .returning(|_, _| false);
        handler.expect_dial().never();

        let (local, raw) = pair(Duration::from_secs(5)).await;
        let session = Session::builder("agent-1", SessionRole::Client)
            .config(test_config())
            .handler(Arc::new(handler))
            .build(local);
        let cancel = CancellationToken::new();
        {
            let session = session.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { session.serve(cancel).await });
        }

        raw.write_message(
            &Message::connect(1, "tcp", "169.254.169.254:80"),
            Duration::from_secs(1),
        )
        .await
        .expect("write connect");

        let reply = raw.next_message().await.expect("read reply");
        assert!(matches!(reply.payload, Payload::Error(RemoteError::Message(_))));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_remote_pause_holds_writes() {
        let (session, raw, _cancel) = served_with_raw(SessionRole::Server).await;
        let conn = session.server_connect("tcp", "10.0.0.1:80").await.expect("connect");
        let _ = raw.next_message().await.expect("connect");

        raw.write_message(&Message::pause(conn.conn_id()), Duration::from_secs(1))
            .await
            .expect("write pause");
        {
            let conn = conn.clone();
            eventually(move || conn.is_write_paused()).await;
        }

        let writer = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.write(Bytes::from_static(b"after resume")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());

        raw.write_message(&Message::resume(conn.conn_id()), Duration::from_secs(1))
            .await
            .expect("write resume");
        assert_eq!(writer.await.expect("join"), Ok(12));

        let data = raw.next_message().await.expect("read data");
        assert_eq!(data.payload, Payload::Data(Bytes::from_static(b"after resume")));
    }

    #[tokio::test]
    async fn test_remote_error_closes_stream() {
        let (session, raw, _cancel) = served_with_raw(SessionRole::Server).await;
        let conn = session.server_connect("tcp", "10.0.0.1:80").await.expect("connect");
        let _ = raw.next_message().await.expect("connect");

        raw.write_message(
            &Message::error(conn.conn_id(), RemoteError::Message("dial tcp: refused".into())),
            Duration::from_secs(1),
        )
        .await
        .expect("write error");

        assert_eq!(
            conn.read_chunk(16).await,
            Err(TunnelError::Remote("dial tcp: refused".into()))
        );
        assert_eq!(session.connection_count(), 0);
    }

    // Story: five streams opened, two closed, only three keep receiving
    #[tokio::test]
    async fn story_connection_table_tracks_open_streams() {
        let (session, raw, _cancel) = served_with_raw(SessionRole::Server).await;

        // Act 1: open five streams
        let mut conns = Vec::new();
        for port in 0..5 {
            let conn = session
                .server_connect("tcp", &format!("10.0.0.1:{}", 8000 + port))
                .await
                .expect("connect");
            let _ = raw.next_message().await.expect("connect message");
            conns.push(conn);
        }
        assert_eq!(session.connection_count(), 5);

        // Act 2: close two of them; each close is announced once
        conns[1].close().await;
        conns[3].close().await;
        conns[3].close().await;
        for expected in [conns[1].conn_id(), conns[3].conn_id()] {
            let message = raw.next_message().await.expect("error message");
            assert_eq!(message.conn_id, expected);
            assert_eq!(message.payload, Payload::Error(RemoteError::Eof));
        }
        assert_eq!(session.connection_count(), 3);

        // Act 3: data for every id; only the open ones see it, exactly once
        for conn in &conns {
            raw.write_message(
                &Message::data(conn.conn_id(), Bytes::from(format!("to-{}", conn.conn_id()))),
                Duration::from_secs(1),
            )
            .await
            .expect("write data");
        }
        for (i, conn) in conns.iter().enumerate() {
            if i == 1 || i == 3 {
                assert_eq!(conn.read_chunk(64).await, Err(TunnelError::ClosedPipe));
            } else {
                let chunk = conn.read_chunk(64).await.expect("read");
                assert_eq!(chunk, Bytes::from(format!("to-{}", conn.conn_id())));
                assert!(conn.status().size == 0);
            }
        }
    }

    #[tokio::test]
    async fn test_add_and_remove_client_track_session_keys() {
        let (session, raw, _cancel) = served_with_raw(SessionRole::Server).await;
        let timeout = Duration::from_secs(1);

        raw.write_message(&Message::add_client(100, "edge-1"), timeout).await.expect("write");
        raw.write_message(&Message::add_client(200, "edge-1"), timeout).await.expect("write");
        {
            let session = session.clone();
            eventually(move || session.has_remote_client("edge-1")).await;
        }

        raw.write_message(&Message::remove_client(100, "edge-1"), timeout).await.expect("write");
        raw.write_message(&Message::add_client(100, "edge-2"), timeout).await.expect("write");
        {
            let session = session.clone();
            eventually(move || session.has_remote_client("edge-2")).await;
        }
        assert!(session.has_remote_client("edge-1"));

        raw.write_message(&Message::remove_client(200, "edge-1"), timeout).await.expect("write");
        {
            let session = session.clone();
            eventually(move || !session.has_remote_client("edge-1")).await;
        }
        assert_eq!(session.remote_client_keys(), vec!["edge-2".to_string()]);
    }

    #[tokio::test]
    async fn test_announcements_are_written_in_order() {
        let (session, raw, _cancel) = served_with_raw(SessionRole::Server).await;

        session.announce(Message::add_client(1, "a"));
        session.announce(Message::add_client(1, "b"));
        session.announce(Message::remove_client(1, "a"));

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(raw.next_message().await.expect("announcement").payload);
        }
        assert_eq!(
            seen,
            vec![
                Payload::AddClient("a".into()),
                Payload::AddClient("b".into()),
                Payload::RemoveClient("a".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_accept_path_pipes_to_local_target() {
        let (server_wire, agent_wire) = pair(Duration::from_secs(5)).await;
        let server = Session::builder("agent-1", SessionRole::Server)
            .config(test_config())
            .build(server_wire);
        let agent = Session::builder("agent-1", SessionRole::Client)
            .config(test_config())
            .handler(Arc::new(EchoHandler))
            .build(agent_wire);
        let cancel = CancellationToken::new();
        for session in [server.clone(), agent.clone()] {
            let cancel = cancel.clone();
            tokio::spawn(async move { session.serve(cancel).await });
        }

        let mut stream = server.dial("tcp", "127.0.0.1:7").await.expect("dial");
        stream.write_all(b"hello through the tunnel").await.expect("write");

        let mut buf = vec![0u8; 24];
        stream.read_exact(&mut buf).await.expect("read echo");
        assert_eq!(buf, b"hello through the tunnel");

        stream.close().await;
        {
            let agent = agent.clone();
            eventually(move || agent.connection_count() == 0).await;
        }
        assert_eq!(server.connection_count(), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_dial_failure_reaches_caller() {
        let mut handler = MockConnectHandler::new();
        handler.expect_allow().returning(|_, _| true);
        handler.expect_dial().returning(|_, address| {
            Err(TunnelError::Dial {
                address: address.to_string(),
                reason: "connection refused".into(),
            })
        });

        let (server_wire, agent_wire) = pair(Duration::from_secs(5)).await;
        let server = Session::builder("agent-1", SessionRole::Server)
            .config(test_config())
            .build(server_wire);
        let agent = Session::builder("agent-1", SessionRole::Client)
            .config(test_config())
            .handler(Arc::new(handler))
            .build(agent_wire);
        let cancel = CancellationToken::new();
        for session in [server.clone(), agent.clone()] {
            let cancel = cancel.clone();
            tokio::spawn(async move { session.serve(cancel).await });
        }

        let conn = server.server_connect("tcp", "127.0.0.1:1").await.expect("connect");
        assert_eq!(
            conn.read_chunk(16).await,
            Err(TunnelError::Remote("dial 127.0.0.1:1: connection refused".into()))
        );
        {
            let agent = agent.clone();
            eventually(move || agent.connection_count() == 0).await;
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_teardown_closes_every_stream() {
        let (session, raw, _cancel) = served_with_raw(SessionRole::Server).await;
        let first = session.server_connect("tcp", "10.0.0.1:1").await.expect("connect");
        let second = session.server_connect("tcp", "10.0.0.1:2").await.expect("connect");

        raw.close(Duration::from_secs(1)).await;
        drop(raw);

        assert_eq!(first.read_chunk(8).await, Err(TunnelError::ClosedPipe));
        assert_eq!(
            second.write(Bytes::from_static(b"x")).await,
            Err(TunnelError::ClosedPipe)
        );
        {
            let session = session.clone();
            eventually(move || session.is_closed()).await;
        }
        assert_eq!(session.connection_count(), 0);
        assert_eq!(
            session.server_connect("tcp", "10.0.0.1:3").await.err(),
            Some(TunnelError::ClosedPipe)
        );
    }

    #[tokio::test]
    async fn test_malformed_frame_ends_session_and_fails_streams() {
        let mut oversized = BytesMut::new();
        put_varint(&mut oversized, 1);
        put_varint(&mut oversized, 1);
        put_varint(&mut oversized, remotedialer_proto::MessageType::AddClient.code());
        oversized.extend_from_slice(&[b'k'; remotedialer_proto::MAX_CONTROL_PAYLOAD + 1]);
        let frames = [Bytes::from_static(&[0x80]), oversized.freeze()];

        for frame in frames {
            let (local, raw) = pair(Duration::from_secs(5)).await;
            let session = Session::builder("agent-1", SessionRole::Server)
                .config(test_config())
                .build(local);
            let serve = {
                let session = session.clone();
                tokio::spawn(async move { session.serve(CancellationToken::new()).await })
            };
            let first = session.server_connect("tcp", "10.0.0.1:1").await.expect("connect");
            let second = session.server_connect("tcp", "10.0.0.1:2").await.expect("connect");

            raw.write_frame(WireFrame::Binary(frame), Duration::from_secs(1))
                .await
                .expect("write frame");

            assert!(matches!(serve.await.expect("join"), Err(TunnelError::Framing(_))));
            assert!(session.is_closed());
            assert_eq!(session.connection_count(), 0);
            assert!(matches!(first.read_chunk(8).await, Err(TunnelError::Framing(_))));
            assert!(matches!(
                second.write(Bytes::from_static(b"x")).await,
                Err(TunnelError::Framing(_))
            ));
        }
    }

    /// Local target that resets the connection on first read
    struct ResetIo;

    impl AsyncRead for ResetIo {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::ErrorKind::ConnectionReset.into()))
        }
    }

    impl AsyncWrite for ResetIo {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_local_pipe_failure_reaches_caller() {
        let mut handler = MockConnectHandler::new();
        handler.expect_allow().returning(|_, _| true);
        handler
            .expect_dial()
            .returning(|_, _| Ok(Box::new(ResetIo) as Box<dyn AsyncIo>));

        let (server_wire, agent_wire) = pair(Duration::from_secs(5)).await;
        let server = Session::builder("agent-1", SessionRole::Server)
            .config(test_config())
            .build(server_wire);
        let agent = Session::builder("agent-1", SessionRole::Client)
            .config(test_config())
            .handler(Arc::new(handler))
            .build(agent_wire);
        let cancel = CancellationToken::new();
        for session in [server.clone(), agent.clone()] {
            let cancel = cancel.clone();
            tokio::spawn(async move { session.serve(cancel).await });
        }

        let conn = server.server_connect("tcp", "127.0.0.1:7").await.expect("connect");
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset).to_string();
        assert_eq!(conn.read_chunk(16).await, Err(TunnelError::Remote(reset)));
        {
            let agent = agent.clone();
            eventually(move || agent.connection_count() == 0).await;
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_announcer_survives_unencodable_message() {
        let (session, raw, _cancel) = served_with_raw(SessionRole::Server).await;

        let too_long = "x".repeat(remotedialer_proto::MAX_CONTROL_PAYLOAD + 1);
        session.announce(Message::add_client(1, too_long));
        session.announce(Message::add_client(1, "b"));

        let next = tokio::time::timeout(Duration::from_secs(2), raw.next_message())
            .await
            .expect("later announcement still written")
            .expect("read");
        assert_eq!(next.payload, Payload::AddClient("b".into()));
        assert!(!session.is_closed());
    }

    /// Accepts like [`EchoHandler`] and counts `allow` calls
    #[derive(Default)]
    struct CountingHandler {
        allows: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ConnectHandler for CountingHandler {
        fn allow(&self, proto: &str, address: &str) -> bool {
            self.allows.fetch_add(1, Ordering::SeqCst);
            EchoHandler.allow(proto, address)
        }

        async fn dial(&self, proto: &str, address: &str) -> Result<Box<dyn AsyncIo>, TunnelError> {
            EchoHandler.dial(proto, address).await
        }
    }

    #[tokio::test]
    async fn test_duplicate_connect_keeps_live_stream() {
        let handler = Arc::new(CountingHandler::default());
        let (local, raw) = pair(Duration::from_secs(5)).await;
        let session = Session::builder("agent-1", SessionRole::Client)
            .config(test_config())
            .handler(handler.clone())
            .build(local);
        let cancel = CancellationToken::new();
        {
            let session = session.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { session.serve(cancel).await });
        }

        let timeout = Duration::from_secs(1);
        raw.write_message(&Message::connect(7, "tcp", "127.0.0.1:7"), timeout)
            .await
            .expect("write connect");
        {
            let session = session.clone();
            eventually(move || session.connection_count() == 1).await;
        }
        raw.write_message(&Message::connect(7, "tcp", "127.0.0.1:7"), timeout)
            .await
            .expect("write duplicate");
        raw.write_message(&Message::data(7, Bytes::from_static(b"still here")), timeout)
            .await
            .expect("write data");

        // The echo arrives with no refusal for the live id ahead of it.
        let mut echoed = Vec::new();
        while echoed.len() < 10 {
            let message = raw.next_message().await.expect("read");
            assert_eq!(message.conn_id, 7);
            match message.payload {
                Payload::Data(bytes) => echoed.extend_from_slice(&bytes),
                other => panic!("unexpected message {other:?}"),
            }
        }
        assert_eq!(echoed, b"still here");
        assert_eq!(handler.allows.load(Ordering::SeqCst), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancel_returns_ok_and_closes_streams() {
        let (local, _raw) = pair(Duration::from_secs(5)).await;
        let session = Session::builder("agent-1", SessionRole::Server)
            .config(test_config())
            .build(local);
        let cancel = CancellationToken::new();
        let serve = {
            let session = session.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { session.serve(cancel).await })
        };
        let conn = session.server_connect("tcp", "10.0.0.1:1").await.expect("connect");

        cancel.cancel();
        assert_eq!(serve.await.expect("join"), Ok(()));
        assert_eq!(conn.read_chunk(8).await, Err(TunnelError::ClosedPipe));
    }

    #[tokio::test]
    async fn test_client_role_sends_pings() {
        use futures::channel::mpsc as fmpsc;
        use futures::{SinkExt, StreamExt};

        let (_in_tx, in_rx) = fmpsc::unbounded::<Result<WireFrame, TunnelError>>();
        let (out_tx, mut out_rx) = fmpsc::unbounded();
        let wire = WireConnection::from_parts(
            out_tx.sink_map_err(|e| TunnelError::Transport(e.to_string())),
            in_rx,
            Duration::from_secs(5),
        );
        let session = Session::builder("agent-1", SessionRole::Client)
            .config(test_config())
            .build(wire);
        let cancel = CancellationToken::new();
        {
            let session = session.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { session.serve(cancel).await });
        }

        let frame = tokio::time::timeout(Duration::from_secs(2), out_rx.next())
            .await
            .expect("ping within interval");
        assert_eq!(frame, Some(WireFrame::Ping(Bytes::new())));
        cancel.cancel();
    }
}
