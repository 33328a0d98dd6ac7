//! Live connection table for the server.
//!
//! Every accepted connection holds a [`ConnectionGuard`]; dropping the guard
//! removes the entry, so the count is right however the handler exits.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type ConnectionId = u64;

struct Entry {
    peer: SocketAddr,
    token: CancellationToken,
}

pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, Entry>>,
    next_id: AtomicU64,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_connections,
        }
    }

    /// Admit a connection unless the table is full.
    ///
    /// The connection's token is a child of `parent`, so cancelling the
    /// server token reaches every connection.
    pub fn try_register(self: &Arc<Self>, peer: SocketAddr, parent: &CancellationToken) -> Option<ConnectionGuard> {
        let mut connections = self.lock();
        if connections.len() >= self.max_connections {
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = parent.child_token();
        connections.insert(
            id,
            Entry {
                peer,
                token: token.clone(),
            },
        );
        debug!("Registered connection {} from {} ({} live)", id, peer, connections.len());

        Some(ConnectionGuard {
            id,
            token,
            registry: Arc::clone(self),
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal every live connection to close; returns how many were signalled
    pub fn close_all(&self) -> usize {
        let connections = self.lock();
        for entry in connections.values() {
            entry.token.cancel();
        }
        connections.len()
    }

    fn remove(&self, id: ConnectionId) {
        if let Some(entry) = self.lock().remove(&id) {
            debug!("Released connection {} from {}", id, entry.peer);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Entry>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Membership in the registry for as long as it lives
pub struct ConnectionGuard {
    id: ConnectionId,
    token: CancellationToken,
    registry: Arc<ConnectionRegistry>,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
