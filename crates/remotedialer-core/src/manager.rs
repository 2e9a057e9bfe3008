//! Process-wide session registry and dial routing
//!
//! # Resolution order
//!
//! 1. A direct client session registered under the identity (newest wins)
//! 2. Any peer session whose far side announced the identity via AddClient
//!
//! # Announcements
//!
//! Listener sessions (outbound peer links) learn about every direct client
//! through AddClient/RemoveClient messages. A listener added late receives
//! the current client set first. Peer sessions are never announced, so
//! reachability does not loop through the federation mesh.
//!
//! All registry state sits behind one mutex; mutations are rare next to
//! data-plane traffic. Announcements are queued on each listener and never
//! written while the lock is held.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use remotedialer_common::metrics;
use remotedialer_proto::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{Dialer, Session, TunnelError};

#[derive(Default)]
struct Registry {
    clients: HashMap<String, Vec<Session>>,
    peers: HashMap<String, Vec<Session>>,
    listeners: HashMap<i64, Session>,
}

/// Registry of live sessions keyed by client identity
#[derive(Default)]
pub struct SessionManager {
    registry: Mutex<Registry>,
}

impl SessionManager {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a session under its client key
    pub fn add(&self, session: Session) {
        let client_key = session.client_key().to_string();
        let peer = session.is_peer();
        {
            let mut registry = self.lock();
            if peer {
                registry
                    .peers
                    .entry(client_key.clone())
                    .or_default()
                    .push(session.clone());
            } else {
                for listener in registry.listeners.values() {
                    listener.announce(Message::add_client(session.session_key(), &client_key));
                }
                registry
                    .clients
                    .entry(client_key.clone())
                    .or_default()
                    .push(session.clone());
            }
        }
        metrics::record_session(&client_key, peer, true);
        info!(client_key = %client_key, peer, session_key = session.session_key(), "session added");
    }

    /// Unregister a session; unknown sessions are ignored
    pub fn remove(&self, session: &Session) {
        let client_key = session.client_key();
        let peer = session.is_peer();
        let removed = {
            let mut registry = self.lock();
            registry.listeners.remove(&session.session_key());

            let map = if peer {
                &mut registry.peers
            } else {
                &mut registry.clients
            };
            let removed = match map.get_mut(client_key) {
                Some(sessions) => {
                    let before = sessions.len();
                    sessions.retain(|s| !s.same_session(session));
                    let removed = sessions.len() != before;
                    if sessions.is_empty() {
                        map.remove(client_key);
                    }
                    removed
                }
                None => false,
            };

            if removed && !peer {
                for listener in registry.listeners.values() {
                    listener.announce(Message::remove_client(session.session_key(), client_key));
                }
            }
            removed
        };

        if removed {
            metrics::record_session(client_key, peer, false);
            info!(client_key = %client_key, peer, session_key = session.session_key(), "session removed");
        }
    }

    /// Keep `listener` informed of every direct client, starting with the
    /// ones already registered
    pub fn add_listener(&self, listener: Session) {
        let mut registry = self.lock();
        for (client_key, sessions) in &registry.clients {
            for session in sessions {
                listener.announce(Message::add_client(session.session_key(), client_key));
            }
        }
        debug!(listener = %listener.client_key(), "listener added");
        registry.listeners.insert(listener.session_key(), listener);
    }

    /// Stop announcing to `listener`
    pub fn remove_listener(&self, listener: &Session) {
        self.lock().listeners.remove(&listener.session_key());
    }

    /// Resolve a dialer for `client_key`
    pub fn get_dialer(&self, client_key: &str) -> Result<Dialer, TunnelError> {
        let registry = self.lock();

        if let Some(session) = registry.clients.get(client_key).and_then(|s| s.last()) {
            return Ok(Dialer::direct(session.clone(), client_key));
        }

        for sessions in registry.peers.values() {
            for session in sessions {
                if session.has_remote_client(client_key) {
                    return Ok(Dialer::federated(session.clone(), client_key));
                }
            }
        }

        Err(TunnelError::NoSession(client_key.to_string()))
    }

    /// Whether `client_key` is reachable directly or through a peer
    pub fn has_session(&self, client_key: &str) -> bool {
        self.get_dialer(client_key).is_ok()
    }

    /// Identities with a direct session, sorted
    pub fn list_clients(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().clients.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Identities of connected peer servers, sorted
    pub fn list_peers(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().peers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Register `session`, serve it until it ends, then unregister it
    pub async fn serve(&self, session: Session, cancel: CancellationToken) -> Result<(), TunnelError> {
        self.add(session.clone());
        let result = session.serve(cancel).await;
        self.remove(&session);
        result
    }
}
