//! The server's shared state, owned in one place and passed around by `Arc`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::broadcast::{BroadcastRouter, BroadcastStats};
use crate::connection::Connection;
use crate::error::SyncError;
use crate::protocol::ConnectionId;
use crate::queue::PacketQueue;
use crate::registry::{ConnectionRegistry, RoleCounts};
use crate::server::ServerConfig;
use crate::store::SharedCodeStore;

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub rejected_handshakes: u64,
    pub packets_processed: u64,
    pub kicks: u64,
    pub active: RoleCounts,
    pub broadcast: BroadcastStats,
}

#[derive(Debug, Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    rejected_handshakes: AtomicU64,
    packets_processed: AtomicU64,
    kicks: AtomicU64,
}

#[derive(Debug)]
pub struct Hub {
    config: ServerConfig,
    store: SharedCodeStore,
    registry: Arc<ConnectionRegistry>,
    router: BroadcastRouter,
    queue: PacketQueue,
    next_id: AtomicU64,
    stats: AtomicServerStats,
}

impl Hub {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        Self {
            config,
            store: SharedCodeStore::new(),
            router: BroadcastRouter::new(registry.clone()),
            registry,
            queue: PacketQueue::new(),
            next_id: AtomicU64::new(1),
            stats: AtomicServerStats::default(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedCodeStore {
        &self.store
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn router(&self) -> &BroadcastRouter {
        &self.router
    }

    pub fn queue(&self) -> &PacketQueue {
        &self.queue
    }

    /// Allocate the id for a freshly accepted socket.
    pub fn next_connection_id(&self) -> ConnectionId {
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Close `connection` for `error` without touching anyone else.
    pub fn kick(&self, connection: &Connection, error: &SyncError) {
        if connection.kick(error.to_string()) {
            self.stats.kicks.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_rejected_handshake(&self) {
        self.stats.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_processed(&self, count: usize) {
        self.stats
            .packets_processed
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub async fn count_by_role(&self) -> RoleCounts {
        self.registry.count_by_role().await
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            rejected_handshakes: self.stats.rejected_handshakes.load(Ordering::Relaxed),
            packets_processed: self.stats.packets_processed.load(Ordering::Relaxed),
            kicks: self.stats.kicks.load(Ordering::Relaxed),
            active: self.registry.count_by_role().await,
            broadcast: self.router.stats(),
        }
    }
}
