//! Framing wrapper around one physical WebSocket
//!
//! A [`WireConnection`] hides which WebSocket library produced the socket
//! (axum on the accepting side, tokio-tungstenite on the dialing side) behind
//! a small frame enum, and enforces the deadlines the session needs:
//!
//! - writes are serialized by a mutex and bounded by a per-call deadline
//! - reads are bounded by the idle timeout; any frame, including a pong,
//!   resets it
//!
//! Pongs for inbound pings are queued by the WebSocket layer itself.

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use remotedialer_proto::Message;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite;
use tracing::trace;

use crate::TunnelError;

/// One WebSocket frame, library-agnostic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// Binary frame carrying exactly one encoded message
    Binary(Bytes),
    /// Text frame; never valid in this protocol
    Text(String),
    /// Keep-alive ping
    Ping(Bytes),
    /// Keep-alive answer
    Pong(Bytes),
    /// Close handshake
    Close,
}

type FrameSink = Pin<Box<dyn Sink<WireFrame, Error = TunnelError> + Send>>;
type FrameStream = Pin<Box<dyn Stream<Item = Result<WireFrame, TunnelError>> + Send>>;

/// A full-duplex message socket with serialized writes
pub struct WireConnection {
    sink: Mutex<FrameSink>,
    stream: Mutex<FrameStream>,
    idle_timeout: Duration,
}

impl WireConnection {
    /// Wrap any sink/stream pair of [`WireFrame`]s
    pub fn from_parts<S, R>(sink: S, stream: R, idle_timeout: Duration) -> Self
    where
        S: Sink<WireFrame, Error = TunnelError> + Send + 'static,
        R: Stream<Item = Result<WireFrame, TunnelError>> + Send + 'static,
    {
        Self {
            sink: Mutex::new(Box::pin(sink)),
            stream: Mutex::new(Box::pin(stream)),
            idle_timeout,
        }
    }

    /// Wrap a socket accepted through axum's upgrade extractor
    pub fn from_axum(socket: axum::extract::ws::WebSocket, idle_timeout: Duration) -> Self {
        use axum::extract::ws::Message as AxumMessage;

        let (sink, stream) = socket.split();
        let sink = sink
            .sink_map_err(|e| TunnelError::Transport(e.to_string()))
            .with(|frame: WireFrame| {
                future::ready(Ok::<_, TunnelError>(match frame {
                    WireFrame::Binary(b) => AxumMessage::Binary(b),
                    WireFrame::Text(t) => AxumMessage::Text(t.into()),
                    WireFrame::Ping(b) => AxumMessage::Ping(b),
                    WireFrame::Pong(b) => AxumMessage::Pong(b),
                    WireFrame::Close => AxumMessage::Close(None),
                }))
            });
        let stream = stream.map(|item| {
            item.map(|msg| match msg {
                AxumMessage::Binary(b) => WireFrame::Binary(b),
                AxumMessage::Text(t) => WireFrame::Text(t.as_str().to_string()),
                AxumMessage::Ping(b) => WireFrame::Ping(b),
                AxumMessage::Pong(b) => WireFrame::Pong(b),
                AxumMessage::Close(_) => WireFrame::Close,
            })
            .map_err(|e| TunnelError::Transport(e.to_string()))
        });
        Self::from_parts(sink, stream, idle_timeout)
    }

    /// Wrap a tokio-tungstenite socket, client or server side
    pub fn from_tungstenite<T>(
        socket: tokio_tungstenite::WebSocketStream<T>,
        idle_timeout: Duration,
    ) -> Self
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        use tungstenite::Message as WsMessage;

        let (sink, stream) = socket.split();
        let sink = sink
            .sink_map_err(|e| TunnelError::Transport(e.to_string()))
            .with(|frame: WireFrame| {
                future::ready(Ok::<_, TunnelError>(match frame {
                    WireFrame::Binary(b) => WsMessage::Binary(b),
                    WireFrame::Text(t) => WsMessage::Text(t.into()),
                    WireFrame::Ping(b) => WsMessage::Ping(b),
                    WireFrame::Pong(b) => WsMessage::Pong(b),
                    WireFrame::Close => WsMessage::Close(None),
                }))
            });
        let stream = stream.filter_map(|item| {
            future::ready(match item {
                Ok(WsMessage::Binary(b)) => Some(Ok(WireFrame::Binary(b))),
                Ok(WsMessage::Text(t)) => Some(Ok(WireFrame::Text(t.as_str().to_string()))),
                Ok(WsMessage::Ping(b)) => Some(Ok(WireFrame::Ping(b))),
                Ok(WsMessage::Pong(b)) => Some(Ok(WireFrame::Pong(b))),
                Ok(WsMessage::Close(_)) => Some(Ok(WireFrame::Close)),
                // Raw frames only surface when reading with a custom config
                Ok(WsMessage::Frame(_)) => None,
                Err(e) => Some(Err(TunnelError::Transport(e.to_string()))),
            })
        });
        Self::from_parts(sink, stream, idle_timeout)
    }

    /// Write one frame, holding the write lock for the whole send
    pub async fn write_frame(
        &self,
        frame: WireFrame,
        deadline: Duration,
    ) -> Result<(), TunnelError> {
        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(deadline, sink.send(frame)).await {
            Ok(result) => result,
            Err(_) => Err(TunnelError::Timeout),
        }
    }

    /// Encode and write one message as a single binary frame
    pub async fn write_message(
        &self,
        message: &Message,
        deadline: Duration,
    ) -> Result<(), TunnelError> {
        let frame = message.encode()?;
        self.write_frame(WireFrame::Binary(frame), deadline).await
    }

    /// Send a keep-alive ping
    pub async fn ping(&self, deadline: Duration) -> Result<(), TunnelError> {
        self.write_frame(WireFrame::Ping(Bytes::new()), deadline).await
    }

    /// Read the next message, skipping keep-alive frames
    ///
    /// Fails with [`TunnelError::Timeout`] after `idle_timeout` without any
    /// frame, [`TunnelError::ClosedPipe`] once the socket is closed, and
    /// [`TunnelError::Framing`] for a frame that is not a valid message.
    pub async fn next_message(&self) -> Result<Message, TunnelError> {
        let mut stream = self.stream.lock().await;
        loop {
            let frame = match tokio::time::timeout(self.idle_timeout, stream.next()).await {
                Err(_) => return Err(TunnelError::Timeout),
                Ok(None) => return Err(TunnelError::ClosedPipe),
                Ok(Some(frame)) => frame?,
            };
            match frame {
                WireFrame::Binary(bytes) => return Ok(Message::decode(bytes)?),
                WireFrame::Ping(_) | WireFrame::Pong(_) => {
                    trace!("keep-alive frame");
                }
                WireFrame::Text(_) => {
                    return Err(TunnelError::Transport(
                        "unexpected text frame on tunnel socket".to_string(),
                    ))
                }
                WireFrame::Close => return Err(TunnelError::ClosedPipe),
            }
        }
    }

    /// Start the close handshake, best effort
    pub async fn close(&self, deadline: Duration) {
        let _ = self.write_frame(WireFrame::Close, deadline).await;
    }
}
