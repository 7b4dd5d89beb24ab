//! Registered connections, keyed by id.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Bytes;

use crate::connection::{Connection, Role};
use crate::protocol::ConnectionId;

/// Number of registered connections per role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleCounts {
    pub users: usize,
    pub developers: usize,
}

impl RoleCounts {
    pub fn total(&self) -> usize {
        self.users + self.developers
    }
}

/// Result of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Peers whose writer accepted the frame.
    pub delivered: usize,
    /// Peers that matched but had already gone away.
    pub dropped: usize,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<BTreeMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, connection: Arc<Connection>) {
        let mut connections = self.connections.write().await;
        connections.insert(connection.id(), connection);
    }

    pub async fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.write().await.remove(&id)
    }

    pub async fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Point-in-time copy of the matching connections.
    pub async fn snapshot<F>(&self, predicate: F) -> Vec<Arc<Connection>>
    where
        F: Fn(&Connection) -> bool,
    {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| predicate(c))
            .cloned()
            .collect()
    }

    /// Send `bytes` to every connection matching `predicate`.
    ///
    /// Sends happen after the lock is released, so registration and
    /// removal never wait on a fan-out. A peer that has gone away is
    /// counted as dropped and does not affect the others.
    pub async fn broadcast<F>(&self, predicate: F, bytes: Bytes) -> Delivery
    where
        F: Fn(&Connection) -> bool,
    {
        let targets = self.snapshot(predicate).await;
        let mut delivery = Delivery::default();
        for connection in targets {
            if connection.send_bytes(bytes.clone()) {
                delivery.delivered += 1;
            } else {
                log::debug!("Skipping {connection}: writer already closed");
                delivery.dropped += 1;
            }
        }
        delivery
    }

    pub async fn count_by_role(&self) -> RoleCounts {
        let connections = self.connections.read().await;
        let mut counts = RoleCounts::default();
        for connection in connections.values() {
            match connection.role() {
                Role::User => counts.users += 1,
                Role::Developer => counts.developers += 1,
            }
        }
        counts
    }
}
