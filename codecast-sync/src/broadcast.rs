//! Role-filtered fan-out over the connection registry.
//!
//! Each packet is encoded once and the same buffer is queued on every
//! target, so a fan-out costs one serialization regardless of peer count.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::connection::Connection;
use crate::error::SyncError;
use crate::protocol::Packet;
use crate::registry::{ConnectionRegistry, Delivery};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub broadcasts: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
}

/// Lock-free counters; read through [`BroadcastRouter::stats`].
#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    broadcasts: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

#[derive(Debug)]
pub struct BroadcastRouter {
    registry: Arc<ConnectionRegistry>,
    stats: AtomicBroadcastStats,
}

impl BroadcastRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Send `packet` to every registered connection matching `predicate`.
    pub async fn broadcast<F>(&self, predicate: F, packet: &Packet) -> Result<Delivery, SyncError>
    where
        F: Fn(&Connection) -> bool,
    {
        let encoded = packet.encode()?;
        let delivery = self.registry.broadcast(predicate, encoded.into()).await;

        self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.stats
            .frames_sent
            .fetch_add(delivery.delivered as u64, Ordering::Relaxed);
        self.stats
            .frames_dropped
            .fetch_add(delivery.dropped as u64, Ordering::Relaxed);

        log::debug!(
            "Broadcast {} to {} peers ({} dropped)",
            packet.kind(),
            delivery.delivered,
            delivery.dropped
        );
        Ok(delivery)
    }

    /// Everyone who is not a developer.
    pub async fn to_users(&self, packet: &Packet) -> Result<Delivery, SyncError> {
        self.broadcast(|c| !c.is_developer(), packet).await
    }

    pub async fn to_developers(&self, packet: &Packet) -> Result<Delivery, SyncError> {
        self.broadcast(Connection::is_developer, packet).await
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            broadcasts: self.stats.broadcasts.load(Ordering::Relaxed),
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}
