//! Local side of the accept path
//!
//! The server asks the agent to connect to `proto/address`; the agent checks
//! the request against its [`AllowList`] and dials the target from its own
//! network position.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use remotedialer_core::{AsyncIo, ConnectHandler, TunnelError};
use tokio::net::TcpStream;
use tracing::debug;

/// Connect targets the agent is willing to dial
///
/// Rules are `proto/address`. A trailing `*` on the address matches any
/// suffix, `*` as the proto matches any protocol, and a bare `*` rule
/// matches everything. An empty list allows nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    rules: Vec<String>,
}

impl AllowList {
    /// List that allows every target
    pub fn allow_all() -> Self {
        Self {
            rules: vec!["*".to_string()],
        }
    }

    /// Build from individual rules
    pub fn new<I, S>(rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rules: rules
                .into_iter()
                .map(Into::into)
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect(),
        }
    }

    /// Whether no rule is configured
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether a Connect to `proto/address` may be dialed
    pub fn allows(&self, proto: &str, address: &str) -> bool {
        self.rules.iter().any(|rule| rule_matches(rule, proto, address))
    }
}

fn rule_matches(rule: &str, proto: &str, address: &str) -> bool {
    if rule == "*" {
        return true;
    }
    let Some((rule_proto, rule_address)) = rule.split_once('/') else {
        return false;
    };
    if rule_proto != "*" && rule_proto != proto {
        return false;
    }
    match rule_address.strip_suffix('*') {
        Some(prefix) => address.starts_with(prefix),
        None => rule_address == address,
    }
}

impl FromStr for AllowList {
    type Err = std::convert::Infallible;

    /// Comma-separated rules, e.g. `tcp/127.0.0.1:*,unix/*`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s.split(',')))
    }
}

impl fmt::Display for AllowList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rules.join(","))
    }
}

/// Dials allowed Connect targets from the agent's host
#[derive(Debug, Clone)]
pub struct LocalDialer {
    allow: AllowList,
}

impl LocalDialer {
    /// Dialer restricted to `allow`
    pub fn new(allow: AllowList) -> Self {
        Self { allow }
    }
}

#[async_trait]
impl ConnectHandler for LocalDialer {
    fn allow(&self, proto: &str, address: &str) -> bool {
        self.allow.allows(proto, address)
    }

    async fn dial(&self, proto: &str, address: &str) -> Result<Box<dyn AsyncIo>, TunnelError> {
        dial_local(proto, address).await
    }
}

/// Open `proto/address` on this host
///
/// Supports `tcp`, `tcp4`, `tcp6` and, on unix, `unix`.
pub async fn dial_local(proto: &str, address: &str) -> Result<Box<dyn AsyncIo>, TunnelError> {
    let dial_err = |reason: String| TunnelError::Dial {
        address: address.to_string(),
        reason,
    };

    match proto {
        "tcp" => {
            let stream = TcpStream::connect(address)
                .await
                .map_err(|e| dial_err(e.to_string()))?;
            debug!(%proto, %address, "dialed local target");
            Ok(Box::new(stream))
        }
        "tcp4" | "tcp6" => {
            let want_v4 = proto == "tcp4";
            let candidates = tokio::net::lookup_host(address)
                .await
                .map_err(|e| dial_err(e.to_string()))?
                .filter(|addr| addr.is_ipv4() == want_v4);

            let mut last_err = format!("no {proto} address found");
            for addr in candidates {
                match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        debug!(%proto, %address, resolved = %addr, "dialed local target");
                        return Ok(Box::new(stream));
                    }
                    Err(e) => last_err = e.to_string(),
                }
            }
            Err(dial_err(last_err))
        }
        #[cfg(unix)]
        "unix" => {
            let stream = tokio::net::UnixStream::connect(address)
                .await
                .map_err(|e| dial_err(e.to_string()))?;
            Ok(Box::new(stream))
        }
        other => Err(TunnelError::InvalidNetwork(other.to_string())),
    }
}
