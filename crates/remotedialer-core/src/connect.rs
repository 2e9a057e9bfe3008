//! Outbound WebSocket dial shared by agents and peer links
//!
//! `ws://` URLs are dialed in the clear; `wss://` URLs use rustls with the
//! webpki root set, or with verification disabled when the link is
//! authenticated by other means (peer id/token headers).

use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use thiserror::Error;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::Connector;
use tracing::debug;

use crate::WireConnection;

/// Failure to establish an outbound tunnel socket
#[derive(Debug, Error)]
pub enum ConnectError {
    /// URL could not be turned into a WebSocket request
    #[error("invalid url {url}: {reason}")]
    InvalidUrl {
        /// URL as given
        url: String,
        /// Parser message
        reason: String,
    },

    /// Header name or value not representable in HTTP
    #[error("invalid header {0}")]
    InvalidHeader(String),

    /// TLS client setup failed
    #[error("tls setup failed: {0}")]
    Tls(String),

    /// TCP connect or WebSocket handshake failed (including HTTP rejections)
    #[error("connect to {url} failed: {reason}")]
    Handshake {
        /// URL dialed
        url: String,
        /// Underlying error
        reason: String,
    },

    /// Handshake did not finish in time
    #[error("handshake with {0} timed out")]
    HandshakeTimeout(String),
}

/// Parameters for one outbound dial
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// `ws://` or `wss://` URL of the upgrade endpoint
    pub url: String,
    /// Extra request headers (identity, token, peer credentials)
    pub headers: Vec<(String, String)>,
    /// Accept any server certificate
    pub insecure_skip_verify: bool,
    /// Bound on TCP connect plus TLS and WebSocket handshakes
    pub handshake_timeout: Duration,
    /// Idle timeout handed to the resulting [`WireConnection`]
    pub idle_timeout: Duration,
}

/// Dial `options.url` and wrap the upgraded socket
pub async fn connect_websocket(options: &ConnectOptions) -> Result<WireConnection, ConnectError> {
    let mut request =
        options
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectError::InvalidUrl {
                url: options.url.clone(),
                reason: e.to_string(),
            })?;

    for (name, value) in &options.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ConnectError::InvalidHeader(name.clone()))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| ConnectError::InvalidHeader(name.to_string()))?;
        request.headers_mut().insert(name, value);
    }

    let connector = if options.insecure_skip_verify {
        Some(Connector::Rustls(Arc::new(insecure_client_config()?)))
    } else {
        None
    };

    debug!(url = %options.url, insecure = options.insecure_skip_verify, "dialing tunnel endpoint");
    let handshake =
        tokio_tungstenite::connect_async_tls_with_config(request, None, true, connector);
    let (socket, _response) = match tokio::time::timeout(options.handshake_timeout, handshake).await {
        Err(_) => return Err(ConnectError::HandshakeTimeout(options.url.clone())),
        Ok(Err(e)) => {
            return Err(ConnectError::Handshake {
                url: options.url.clone(),
                reason: e.to_string(),
            })
        }
        Ok(Ok(connected)) => connected,
    };

    Ok(WireConnection::from_tungstenite(socket, options.idle_timeout))
}

fn insecure_client_config() -> Result<rustls::ClientConfig, ConnectError> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ConnectError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
        .with_no_client_auth();
    Ok(config)
}

/// Accepts every server certificate; signatures are still checked
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
