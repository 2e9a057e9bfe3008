//! Authorization of inbound tunnel connects
//!
//! An [`Authorizer`] turns the upgrade request's headers into a client
//! identity. Peer servers are checked separately by the [`crate::Server`]
//! before the authorizer runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use remotedialer_common::CLIENT_ID_HEADER;

use crate::error::{Result, ServerError};

/// Decides which client identity, if any, an upgrade request belongs to
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// `Ok(Some(key))` to accept as `key`, `Ok(None)` to reject with 401,
    /// `Err` when authorization could not be decided
    async fn authorize(&self, headers: &HeaderMap) -> Result<Option<String>>;
}

/// Renders rejected connects as HTTP responses
pub type ErrorWriter = Arc<dyn Fn(ServerError) -> Response + Send + Sync>;

/// Error writer that uses [`ServerError`]'s own response mapping
pub fn default_error_writer() -> ErrorWriter {
    Arc::new(|err: ServerError| err.into_response())
}

/// Extract Bearer token from Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Header value as a non-empty string
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Identity from `X-Tunnel-Client`, token from `Authorization: Bearer`
///
/// A client with its own token must present it. Otherwise the shared token
/// applies when one is configured. With no tokens at all every identified
/// client is accepted.
#[derive(Debug, Clone, Default)]
pub struct HeaderAuthorizer {
    shared_token: Option<String>,
    client_tokens: HashMap<String, String>,
}

impl HeaderAuthorizer {
    /// Authorizer with an optional fleet-wide token
    pub fn new(shared_token: Option<String>) -> Self {
        Self {
            shared_token,
            client_tokens: HashMap::new(),
        }
    }

    /// Require `token` from `client_key` specifically
    pub fn with_client_token(mut self, client_key: impl Into<String>, token: impl Into<String>) -> Self {
        self.client_tokens.insert(client_key.into(), token.into());
        self
    }

    fn expected_token(&self, client_key: &str) -> Option<&str> {
        self.client_tokens
            .get(client_key)
            .or(self.shared_token.as_ref())
            .map(String::as_str)
    }
}

#[async_trait]
impl Authorizer for HeaderAuthorizer {
    async fn authorize(&self, headers: &HeaderMap) -> Result<Option<String>> {
        let Some(client_key) = header_str(headers, CLIENT_ID_HEADER) else {
            return Ok(None);
        };

        match self.expected_token(client_key) {
            None => Ok(Some(client_key.to_string())),
            Some(expected) if extract_bearer_token(headers) == Some(expected) => {
                Ok(Some(client_key.to_string()))
            }
            Some(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, value.parse().expect("header value"));
        }
        headers
    }

    #[test]
    fn test_extract_bearer_token() {
        let h = headers(&[("Authorization", "Bearer abc123")]);
        assert_eq!(extract_bearer_token(&h), Some("abc123"));
        assert_eq!(extract_bearer_token(&HeaderMap::new()), None);

        let basic = headers(&[("Authorization", "Basic abc123")]);
        assert_eq!(extract_bearer_token(&basic), None);
    }

    #[test]
    fn test_header_str_ignores_blank() {
        let h = headers(&[("X-Tunnel-Client", "  ")]);
        assert_eq!(header_str(&h, CLIENT_ID_HEADER), None);
    }

    #[tokio::test]
    async fn test_open_authorizer_accepts_identified_clients() {
        let auth = HeaderAuthorizer::new(None);
        let h = headers(&[("X-Tunnel-Client", "edge-1")]);
        assert_eq!(
            auth.authorize(&h).await.expect("authorize"),
            Some("edge-1".to_string())
        );
        assert_eq!(auth.authorize(&HeaderMap::new()).await.expect("authorize"), None);
    }

    #[tokio::test]
    async fn test_shared_token_required() {
        let auth = HeaderAuthorizer::new(Some("s3cret".into()));

        let good = headers(&[("X-Tunnel-Client", "edge-1"), ("Authorization", "Bearer s3cret")]);
        assert_eq!(auth.authorize(&good).await.expect("authorize"), Some("edge-1".into()));

        let bad = headers(&[("X-Tunnel-Client", "edge-1"), ("Authorization", "Bearer nope")]);
        assert_eq!(auth.authorize(&bad).await.expect("authorize"), None);

        let missing = headers(&[("X-Tunnel-Client", "edge-1")]);
        assert_eq!(auth.authorize(&missing).await.expect("authorize"), None);
    }

    #[tokio::test]
    async fn test_client_token_overrides_shared() {
        let auth = HeaderAuthorizer::new(Some("fleet".into())).with_client_token("edge-2", "own");

        let shared = headers(&[("X-Tunnel-Client", "edge-2"), ("Authorization", "Bearer fleet")]);
        assert_eq!(auth.authorize(&shared).await.expect("authorize"), None);

        let own = headers(&[("X-Tunnel-Client", "edge-2"), ("Authorization", "Bearer own")]);
        assert_eq!(auth.authorize(&own).await.expect("authorize"), Some("edge-2".into()));

        let other = headers(&[("X-Tunnel-Client", "edge-3"), ("Authorization", "Bearer fleet")]);
        assert_eq!(auth.authorize(&other).await.expect("authorize"), Some("edge-3".into()));
    }
}
