//! Role negotiation at the start of every session.
//!
//! Server side:
//! 1. read one `Credential`;
//! 2. `NO_PASSWORD` makes a user, which is sent every developer file;
//! 3. the configured secret makes a developer, which must follow up with
//!    `DeveloperInit` and is sent one `CompleteSnapshot`;
//! 4. anything else is refused with a policy-violation close.
//!
//! The client side sends the mirror image of steps 1 and 3.

use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::connection::{Connection, Outbound, Role};
use crate::error::SyncError;
use crate::hub::Hub;
use crate::protocol::{ConnectionId, Packet, PacketKind, ProtocolError, NO_PASSWORD};
use crate::store::developer_file_packets;

/// What a client presents when it connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    User,
    Developer { secret: String, project_name: String },
}

impl Credential {
    pub fn developer(secret: impl Into<String>, project_name: impl Into<String>) -> Self {
        Self::Developer {
            secret: secret.into(),
            project_name: project_name.into(),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Self::User => Role::User,
            Self::Developer { .. } => Role::Developer,
        }
    }
}

/// Result of a successful server-side negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub role: Role,
    /// Only developers announce a project.
    pub project_name: Option<String>,
}

/// Read the next packet, skipping control frames.
pub(crate) async fn next_packet<S>(stream: &mut S) -> Result<Packet, SyncError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Binary(data))) => return Ok(Packet::decode(&data)?),
            Some(Ok(Message::Text(_))) => {
                return Err(ProtocolError::UnexpectedFrame("text").into());
            }
            Some(Ok(Message::Close(_))) | None => return Err(SyncError::Closed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Server side: decide the role of a freshly accepted connection.
pub async fn negotiate<S>(stream: &mut S, developer_secret: &str) -> Result<Negotiated, SyncError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let credential = match next_packet(stream).await? {
        Packet::Credential(value) => value,
        other => {
            return Err(ProtocolError::UnexpectedPacket {
                expected: PacketKind::Credential,
                actual: other.kind(),
            }
            .into());
        }
    };

    if credential == NO_PASSWORD {
        return Ok(Negotiated {
            role: Role::User,
            project_name: None,
        });
    }

    // An empty secret disables developer logins entirely.
    if developer_secret.is_empty() || credential != developer_secret {
        return Err(SyncError::Authentication);
    }

    match next_packet(stream).await? {
        Packet::DeveloperInit { project_name } => Ok(Negotiated {
            role: Role::Developer,
            project_name: Some(project_name),
        }),
        other => Err(ProtocolError::UnexpectedPacket {
            expected: PacketKind::DeveloperInit,
            actual: other.kind(),
        }
        .into()),
    }
}

/// Server side: send the initial snapshot and register the connection.
///
/// The store section being snapshotted stays read-locked until the
/// connection is registered, so the processing loop cannot slip an update
/// in between that the newcomer would miss. Lock order is store, then
/// registry.
pub async fn admit(
    hub: &Hub,
    id: ConnectionId,
    negotiated: &Negotiated,
    outbound: Outbound,
) -> Result<Arc<Connection>, SyncError> {
    let connection = Arc::new(Connection::new(id, negotiated.role, outbound));

    match negotiated.role {
        Role::User => {
            let files = hub.store().read_developer_files().await;
            for packet in developer_file_packets(&files) {
                connection.send(&packet)?;
            }
            hub.registry().add(connection.clone()).await;
            log::info!("Accepted {connection}, sent {} files", files.len());
        }
        Role::Developer => {
            let submissions = hub.store().read_user_submissions().await;
            connection.send(&Packet::complete_snapshot((*submissions).clone()))?;
            hub.registry().add(connection.clone()).await;
            log::info!(
                "Accepted {connection} for project {:?}",
                negotiated.project_name.as_deref().unwrap_or_default()
            );
        }
    }

    Ok(connection)
}

/// Client side: present `credential` over a fresh session.
pub fn initiate(outbound: &Outbound, credential: &Credential) -> Result<(), SyncError> {
    match credential {
        Credential::User => outbound.send_packet(&Packet::credential(NO_PASSWORD)),
        Credential::Developer {
            secret,
            project_name,
        } => {
            outbound.send_packet(&Packet::credential(secret.as_str()))?;
            outbound.send_packet(&Packet::developer_init(project_name.as_str()))
        }
    }
}
