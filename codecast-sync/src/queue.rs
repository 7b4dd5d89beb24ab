//! Inbound packets waiting for the next processing tick.
//!
//! Read loops append; the processing loop swaps the whole list out in one
//! short critical section and works through the batch without the lock.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::connection::Connection;
use crate::protocol::Packet;

/// A decoded packet together with the connection it arrived on.
#[derive(Debug, Clone)]
pub struct PendingPacket {
    pub connection: Arc<Connection>,
    pub packet: Packet,
}

#[derive(Debug, Default)]
pub struct PacketQueue {
    pending: Mutex<Vec<PendingPacket>>,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, connection: Arc<Connection>, packet: Packet) {
        self.pending
            .lock()
            .await
            .push(PendingPacket { connection, packet });
    }

    /// Take everything queued so far, in arrival order.
    pub async fn drain(&self) -> Vec<PendingPacket> {
        std::mem::take(&mut *self.pending.lock().await)
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::test_connection;
    use crate::connection::Role;

    #[tokio::test]
    async fn test_drain_preserves_arrival_order() {
        let queue = PacketQueue::new();
        let (a, _a_rx) = test_connection(1, Role::User);
        let (b, _b_rx) = test_connection(2, Role::User);

        queue.push(a.clone(), Packet::acknowledgement("1")).await;
        queue.push(b.clone(), Packet::acknowledgement("2")).await;
        queue.push(a.clone(), Packet::acknowledgement("3")).await;
        assert_eq!(queue.len().await, 3);

        let drained = queue.drain().await;
        let order: Vec<_> = drained
            .iter()
            .map(|p| (p.connection.id(), p.packet.clone()))
            .collect();
        assert_eq!(
            order,
            vec![
                (1, Packet::acknowledgement("1")),
                (2, Packet::acknowledgement("2")),
                (1, Packet::acknowledgement("3")),
            ]
        );
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_push_during_processing_lands_in_next_batch() {
        let queue = PacketQueue::new();
        let (conn, _rx) = test_connection(1, Role::User);

        queue.push(conn.clone(), Packet::acknowledgement("first")).await;
        let batch = queue.drain().await;
        queue.push(conn, Packet::acknowledgement("second")).await;

        assert_eq!(batch.len(), 1);
        let next = queue.drain().await;
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].packet, Packet::acknowledgement("second"));
    }

    #[tokio::test]
    async fn test_concurrent_producers_lose_nothing() {
        let queue = Arc::new(PacketQueue::new());
        let mut handles = Vec::new();
        for id in 0..8u64 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let (conn, _rx) = test_connection(id, Role::User);
                for n in 0..100 {
                    queue
                        .push(conn.clone(), Packet::acknowledgement(n.to_string()))
                        .await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let drained = queue.drain().await;
        assert_eq!(drained.len(), 800);
        // Per-connection order is preserved.
        for id in 0..8u64 {
            let seq: Vec<_> = drained
                .iter()
                .filter(|p| p.connection.id() == id)
                .map(|p| p.packet.clone())
                .collect();
            let expected: Vec<_> = (0..100)
                .map(|n| Packet::acknowledgement(n.to_string()))
                .collect();
            assert_eq!(seq, expected);
        }
    }
}
