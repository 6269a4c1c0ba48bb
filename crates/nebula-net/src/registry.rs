//! Directory of live connections keyed by [`ConnectionId`].

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::connection::{Connection, ConnectionId};

/// Error returned when the registry is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection limit of {0} reached")]
pub struct ConnectionLimitReached(pub usize);

/// Thread-safe map of active connections with a capacity limit.
///
/// Typically filled from `on_connected` and emptied from
/// `on_disconnected`; rejecting an insert is how a server caps its
/// connection count.
#[derive(Debug)]
pub struct ConnectionRegistry {
    inner: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a registry holding at most `max_connections` entries.
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            max_connections,
        }
    }

    /// Register a connection. Fails if the registry is full.
    pub fn insert(&self, conn: Arc<Connection>) -> Result<(), ConnectionLimitReached> {
        let mut map = self.inner.write();
        if map.len() >= self.max_connections && !map.contains_key(&conn.id()) {
            return Err(ConnectionLimitReached(self.max_connections));
        }
        map.insert(conn.id(), conn);
        Ok(())
    }

    /// Remove a connection by ID.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner.write().remove(&id)
    }

    /// Look up a connection by ID.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner.read().get(&id).cloned()
    }

    /// Point-in-time copy of every registered connection.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.read().values().cloned().collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Configured capacity.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Send `payload` to every registered connection except `excluding`.
    pub fn broadcast(&self, payload: &Bytes, excluding: Option<ConnectionId>) -> usize {
        self.inner
            .read()
            .values()
            .filter(|c| Some(c.id()) != excluding)
            .filter(|c| c.send(payload.clone()))
            .count()
    }
}
