//! Agent error types

use remotedialer_core::{ConnectError, TunnelError};
use thiserror::Error;

/// Errors that end one agent connection attempt
#[derive(Debug, Error)]
pub enum AgentError {
    /// Invalid agent configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Could not reach or upgrade to the server
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// The established session failed
    #[error("session failed: {0}")]
    Session(#[from] TunnelError),
}
