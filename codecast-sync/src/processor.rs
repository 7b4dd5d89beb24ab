//! Periodic drain of the packet queue: the only writer of the code store.
//!
//! ```text
//! read loop ─┐
//! read loop ─┼─► PacketQueue ──tick──► apply() ──► SharedCodeStore
//! read loop ─┘                            │
//!                                         └──► BroadcastRouter ──► peers
//! ```
//!
//! Each tick swaps the queue out and applies the batch sequentially in
//! arrival order. A failing packet kicks its sender and the batch goes on.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::connection::{Connection, Role};
use crate::error::{SyncError, ValidationError};
use crate::hub::Hub;
use crate::protocol::{Packet, PacketKind};
use crate::queue::PendingPacket;

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub applied: usize,
    pub rejected: usize,
    /// Packets from connections kicked earlier, dropped unprocessed.
    pub skipped: usize,
}

/// Spawn the processing loop; it runs for the lifetime of the runtime.
pub fn spawn(hub: Arc<Hub>) -> JoinHandle<()> {
    let period = hub.config().tick_interval.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            run_tick(&hub).await;
        }
    })
}

/// Drain the queue once and apply everything in it.
pub async fn run_tick(hub: &Hub) -> TickReport {
    let batch = hub.queue().drain().await;
    if batch.is_empty() {
        return TickReport::default();
    }
    log::trace!("Processing {} queued packets", batch.len());

    let mut report = TickReport::default();
    for PendingPacket { connection, packet } in batch {
        if connection.is_kicked() {
            report.skipped += 1;
            continue;
        }
        match apply(hub, &connection, packet).await {
            Ok(()) => report.applied += 1,
            Err(e) => {
                report.rejected += 1;
                hub.kick(&connection, &e);
            }
        }
    }
    hub.record_processed(report.applied + report.rejected);
    report
}

/// Validate and apply one packet, then fan out its effect.
async fn apply(hub: &Hub, connection: &Connection, packet: Packet) -> Result<(), SyncError> {
    let kind = packet.kind();
    match packet {
        Packet::DeveloperUpdate { path, text } => {
            authorize(connection, Role::Developer, kind)?;
            hub.store().set_developer_file(&path, &text).await;
            log::debug!("{connection} updated {path} ({} bytes)", text.len());

            let update = Packet::DeveloperUpdate { path, text };
            hub.router().to_users(&update).await?;
        }

        Packet::UserCodeUpdate { path, lines } => {
            authorize(connection, Role::User, kind)?;
            let config = hub.config();
            validate_submission(&lines, config.max_submission_entries, config.max_line_length)?;
            hub.store()
                .set_user_submission(&path, connection.id(), lines)
                .await;
            log::debug!("{connection} submitted {path}");

            let snapshot = hub.store().complete_snapshot().await;
            hub.router().to_developers(&snapshot).await?;
        }

        Packet::Credential(_)
        | Packet::DeveloperInit { .. }
        | Packet::CompleteSnapshot { .. }
        | Packet::Acknowledgement { .. } => {
            return Err(SyncError::Authorization {
                role: connection.role(),
                kind,
            });
        }
    }
    Ok(())
}

fn authorize(
    connection: &Connection,
    required: Role,
    kind: PacketKind,
) -> Result<(), SyncError> {
    if connection.role() == required {
        Ok(())
    } else {
        Err(SyncError::Authorization {
            role: connection.role(),
            kind,
        })
    }
}

/// Check a submission against the entry-count and line-length limits.
///
/// Lengths are counted in characters, not bytes.
pub fn validate_submission(
    lines: &[String],
    max_entries: usize,
    max_line_length: usize,
) -> Result<(), ValidationError> {
    if lines.len() > max_entries {
        return Err(ValidationError::TooManyEntries {
            count: lines.len(),
            max: max_entries,
        });
    }
    for (index, line) in lines.iter().enumerate() {
        // Byte length bounds char count from above; skip the count for short lines.
        if line.len() <= max_line_length {
            continue;
        }
        let length = line.chars().count();
        if length > max_line_length {
            return Err(ValidationError::LineTooLong {
                line: index,
                length,
                max: max_line_length,
            });
        }
    }
    Ok(())
}
