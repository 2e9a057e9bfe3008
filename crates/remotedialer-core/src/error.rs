//! Tunnel error taxonomy
//!
//! [`TunnelError`] is `Clone` because a stream's first error is sticky: it is
//! stored once and handed to every later `read`/`write` caller.

use std::io;

use remotedialer_proto::{ProtoError, RemoteError};
use thiserror::Error;

/// Errors surfaced by sessions, streams and dialers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TunnelError {
    /// The remote end closed the stream cleanly
    #[error("EOF")]
    Eof,

    /// The stream was closed locally or its session went away
    #[error("io: read/write on closed pipe")]
    ClosedPipe,

    /// The remote end terminated the stream with an error
    #[error("{0}")]
    Remote(String),

    /// A read or write deadline passed
    #[error("i/o timeout")]
    Timeout,

    /// The underlying socket failed
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame could not be decoded or encoded
    #[error("framing error: {0}")]
    Framing(#[from] ProtoError),

    /// No session, direct or federated, can reach the client
    #[error("failed to find session for client {0}")]
    NoSession(String),

    /// The accepting side refused the Connect target
    #[error("connect not allowed: {proto}/{address}")]
    ConnectNotAllowed {
        /// Requested protocol
        proto: String,
        /// Requested address
        address: String,
    },

    /// A network string could not be understood
    #[error("invalid network {0:?}")]
    InvalidNetwork(String),

    /// Dialing the local target failed
    #[error("dial {address}: {reason}")]
    Dial {
        /// Target address
        address: String,
        /// Failure text
        reason: String,
    },

    /// A local socket piped through the stream failed
    #[error("{0}")]
    Io(String),

    /// The owning task was cancelled
    #[error("cancelled")]
    Cancelled,
}

impl TunnelError {
    /// Map a received Error message to the local error it stands for
    pub fn from_remote(err: RemoteError) -> Self {
        match err {
            RemoteError::Eof => Self::Eof,
            RemoteError::Message(text) => Self::Remote(text),
        }
    }

    /// Render this error as the body of an outbound Error message
    pub fn to_remote(&self) -> RemoteError {
        match self {
            Self::Eof => RemoteError::Eof,
            Self::Remote(text) => RemoteError::Message(text.clone()),
            other => RemoteError::Message(other.to_string()),
        }
    }

    /// Whether this is a clean end of stream
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }
}

impl From<TunnelError> for io::Error {
    fn from(err: TunnelError) -> Self {
        let kind = match &err {
            TunnelError::Eof => io::ErrorKind::UnexpectedEof,
            TunnelError::ClosedPipe => io::ErrorKind::BrokenPipe,
            TunnelError::Timeout => io::ErrorKind::TimedOut,
            TunnelError::Remote(_) => io::ErrorKind::ConnectionReset,
            TunnelError::Transport(_) => io::ErrorKind::ConnectionAborted,
            TunnelError::Framing(_) => io::ErrorKind::InvalidData,
            TunnelError::NoSession(_) => io::ErrorKind::NotFound,
            TunnelError::ConnectNotAllowed { .. } => io::ErrorKind::PermissionDenied,
            TunnelError::InvalidNetwork(_) => io::ErrorKind::InvalidInput,
            TunnelError::Dial { .. } => io::ErrorKind::ConnectionRefused,
            TunnelError::Io(_) => io::ErrorKind::Other,
            TunnelError::Cancelled => io::ErrorKind::Interrupted,
        };
        io::Error::new(kind, err)
    }
}

impl From<io::Error> for TunnelError {
    fn from(err: io::Error) -> Self {
        // Errors raised by a tunnel stream come back out unchanged.
        match err.get_ref().and_then(|e| e.downcast_ref::<TunnelError>()) {
            Some(tunnel) => tunnel.clone(),
            None => Self::Io(err.to_string()),
        }
    }
}
