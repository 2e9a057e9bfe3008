//! remotedialer agent
//!
//! The agent runs next to the services the server wants to reach and keeps
//! an **outbound** WebSocket to the server. All traffic rides that socket:
//! the server sends Connect, the agent dials the target locally and pipes
//! bytes back.
//!
//! - [`Agent`]: reconnecting client loop
//! - [`LocalDialer`]: accept path with an [`AllowList`]

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod dial;
pub mod error;

pub use client::{connect_to_server, Agent, OnConnect};
pub use config::AgentConfig;
pub use dial::{dial_local, AllowList, LocalDialer};
pub use error::AgentError;
