//! Server-side connection registry.

use crate::connection::Connection;
use dashmap::DashMap;
use std::sync::Arc;

/// Shared map from connection id to connection.
///
/// Safe for concurrent insert/remove/replace from arbitrary worker tasks.
/// Handlers reach the connection they are serving through an explicit
/// [`crate::DispatchContext`], not through any ambient state.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Installs a connection under its current id.
    ///
    /// A colliding prior holder of the id is probed and closed first.
    pub fn add(&self, conn: Arc<Connection>) {
        let id = conn.id();
        if let Some(prev) = self.connections.insert(id.clone(), conn) {
            if prev.validate() {
                tracing::warn!("replacing live connection '{}'", id);
            }
            prev.close();
        }
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.remove(id).map(|(_, conn)| conn)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    /// Rebinds a connection from `old_id` to `new_id`.
    ///
    /// Used once per connection, when authentication assigns the
    /// application identity. The old mapping is removed, any existing
    /// holder of `new_id` is closed, and the connection is reinserted
    /// under its new id. Returns false when `old_id` is unknown.
    pub fn replace(&self, old_id: &str, new_id: &str) -> bool {
        let Some((_, conn)) = self.connections.remove(old_id) else {
            return false;
        };
        if let Some((_, prev)) = self.connections.remove(new_id) {
            tracing::warn!("closing connection displaced from '{}'", new_id);
            prev.close();
        }
        conn.set_id(new_id);
        self.connections.insert(new_id.to_string(), conn);
        true
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
