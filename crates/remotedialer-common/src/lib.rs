//! Shared plumbing for remotedialer: telemetry, metrics, and env defaults

#![deny(missing_docs)]

pub mod metrics;
pub mod telemetry;

use std::str::FromStr;
use std::time::Duration;

/// Path of the WebSocket upgrade endpoint
pub const DEFAULT_CONNECT_PATH: &str = "/connect";

/// Default listen port for the server
pub const DEFAULT_SERVER_PORT: u16 = 8123;

/// Header carrying a peer server's id on federation connects
pub const PEER_ID_HEADER: &str = "X-API-Tunnel-ID";

/// Header carrying a peer server's token on federation connects
pub const PEER_TOKEN_HEADER: &str = "X-API-Tunnel-Token";

/// Header carrying an agent's client identity
pub const CLIENT_ID_HEADER: &str = "X-Tunnel-Client";

/// Read `name` from the environment and parse it, falling back to `default`
/// when unset or unparseable.
pub fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Read a whole-second duration from the environment.
pub fn env_secs(name: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or(name, default.as_secs()))
}
