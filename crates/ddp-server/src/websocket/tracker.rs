//! Registry of open connections.

use std::collections::HashMap;
use std::sync::Arc;

use ddp_core::ConnectionId;
use tokio::sync::{Notify, RwLock};
use tracing::debug;

use super::connection::Connection;

/// Tracks live connections so the server can count, close and drain them.
#[derive(Default)]
pub struct ConnectionTracker {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    idle: Notify,
}

impl ConnectionTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection.
    pub async fn add(&self, connection: Arc<Connection>) {
        let mut conns = self.connections.write().await;
        let _ = conns.insert(connection.id.clone(), connection);
    }

    /// Remove a connection by ID.
    pub async fn remove(&self, id: &ConnectionId) {
        let mut conns = self.connections.write().await;
        let _ = conns.remove(id);
        if conns.is_empty() {
            self.idle.notify_waiters();
        }
    }

    /// Number of open connections.
    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Close every tracked connection.
    pub async fn close_all(&self) {
        let conns = self.connections.read().await;
        debug!(count = conns.len(), "closing all connections");
        for conn in conns.values() {
            conn.close();
        }
    }

    /// Resolves once no connections remain.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.connections.read().await.is_empty() {
                return;
            }
            notified.await;
        }
    }
}
