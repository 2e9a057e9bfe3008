//! Error types for the tunnel server

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use remotedialer_core::{ConnectError, TunnelError};

/// Result type for server operations
pub type Result<T> = std::result::Result<T, ServerError>;

/// Error type for server operations
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Request carried no acceptable credentials
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The authorizer itself failed
    #[error("authorization failed: {0}")]
    AuthFailed(String),

    /// Request could not be upgraded to a WebSocket
    #[error("websocket upgrade failed: {0}")]
    Upgrade(String),

    /// Invalid server configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Outbound peer link could not be established
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Tunnel-level failure (no session, dial refused, ...)
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

impl ServerError {
    /// HTTP status this error renders as
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServerError::AuthFailed(_) | ServerError::Upgrade(_) => StatusCode::BAD_REQUEST,
            ServerError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServerError::Connect(_) => StatusCode::BAD_GATEWAY,
            ServerError::Tunnel(TunnelError::NoSession(_)) => StatusCode::NOT_FOUND,
            ServerError::Tunnel(TunnelError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            ServerError::Tunnel(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
