//! Dial handle bound to one session

use remotedialer_proto::federated_network;

use crate::{Session, TunnelError, TunnelStream};

/// Opens streams to one client identity through a chosen session
///
/// A direct dialer passes the network through untouched. A federated dialer
/// goes through a peer server and prefixes the network with
/// `"<client_key>::"` so the peer can finish the hop.
#[derive(Debug, Clone)]
pub struct Dialer {
    session: Session,
    client_key: String,
    federated: bool,
}

impl Dialer {
    /// Dial through the client's own session
    pub fn direct(session: Session, client_key: impl Into<String>) -> Self {
        Self {
            session,
            client_key: client_key.into(),
            federated: false,
        }
    }

    /// Dial through a peer server that can reach `client_key`
    pub fn federated(session: Session, client_key: impl Into<String>) -> Self {
        Self {
            session,
            client_key: client_key.into(),
            federated: true,
        }
    }

    /// Identity this dialer reaches
    pub fn client_key(&self) -> &str {
        &self.client_key
    }

    /// Whether dials go through a peer server
    pub fn is_federated(&self) -> bool {
        self.federated
    }

    /// Session the dials travel over
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Network string actually put in the Connect message
    pub fn network_for(&self, network: &str) -> String {
        if self.federated {
            federated_network(&self.client_key, network)
        } else {
            network.to_string()
        }
    }

    /// Open a stream to `address` over `network` (e.g. `"tcp"`)
    pub async fn dial(&self, network: &str, address: &str) -> Result<TunnelStream, TunnelError> {
        if network.is_empty() {
            return Err(TunnelError::InvalidNetwork(network.to_string()));
        }
        self.session.dial(&self.network_for(network), address).await
    }
}
