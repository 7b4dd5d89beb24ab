//! Binary packet codec for the developer/user sync protocol.
//!
//! Every packet travels as one WebSocket binary frame holding a
//! bincode-encoded [`Packet`]:
//! ```text
//! ┌─────────────┬──────────────────────────────────────┐
//! │ variant tag │ fields (varint lengths + UTF-8 text) │
//! │ varint      │ variable                             │
//! └─────────────┴──────────────────────────────────────┘
//! ```
//!
//! Session wire sequence:
//! ```text
//! client                                   server
//!   │── Credential(secret | NO_PASSWORD) ──►│
//!   │── DeveloperInit (developer only) ────►│
//!   │◄── DeveloperUpdate × files (user) ────│
//!   │◄── CompleteSnapshot (developer) ──────│
//!   │◄──────────── live packets ───────────►│
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Credential sent by anonymous users instead of the developer secret.
pub const NO_PASSWORD: &str = "NO_PASSWORD";

/// Process-unique connection identifier, assigned in accept order.
pub type ConnectionId = u64;

/// Aggregated user code: `path → connection id → submitted lines`.
pub type Submissions = BTreeMap<String, BTreeMap<ConnectionId, Vec<String>>>;

/// Every message exchanged over a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    /// First frame of a session; never queued for processing.
    Credential(String),
    /// Sent once by a developer right after its credential.
    DeveloperInit { project_name: String },
    /// Authoritative contents of one developer file.
    DeveloperUpdate { path: String, text: String },
    /// A user's current variant of one file.
    UserCodeUpdate { path: String, lines: Vec<String> },
    /// Full copy of every user submission.
    CompleteSnapshot { submissions: Submissions },
    /// Free-form confirmation text.
    Acknowledgement { message: String },
}

/// Fieldless discriminant of [`Packet`], for logs and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Credential,
    DeveloperInit,
    DeveloperUpdate,
    UserCodeUpdate,
    CompleteSnapshot,
    Acknowledgement,
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Credential => "Credential",
            Self::DeveloperInit => "DeveloperInit",
            Self::DeveloperUpdate => "DeveloperUpdate",
            Self::UserCodeUpdate => "UserCodeUpdate",
            Self::CompleteSnapshot => "CompleteSnapshot",
            Self::Acknowledgement => "Acknowledgement",
        };
        f.write_str(name)
    }
}

impl Packet {
    pub fn credential(value: impl Into<String>) -> Self {
        Self::Credential(value.into())
    }

    pub fn developer_init(project_name: impl Into<String>) -> Self {
        Self::DeveloperInit {
            project_name: project_name.into(),
        }
    }

    pub fn developer_update(path: impl Into<String>, text: impl Into<String>) -> Self {
        Self::DeveloperUpdate {
            path: path.into(),
            text: text.into(),
        }
    }

    pub fn user_code_update(path: impl Into<String>, lines: Vec<String>) -> Self {
        Self::UserCodeUpdate {
            path: path.into(),
            lines,
        }
    }

    pub fn complete_snapshot(submissions: Submissions) -> Self {
        Self::CompleteSnapshot { submissions }
    }

    pub fn acknowledgement(message: impl Into<String>) -> Self {
        Self::Acknowledgement {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> PacketKind {
        match self {
            Self::Credential(_) => PacketKind::Credential,
            Self::DeveloperInit { .. } => PacketKind::DeveloperInit,
            Self::DeveloperUpdate { .. } => PacketKind::DeveloperUpdate,
            Self::UserCodeUpdate { .. } => PacketKind::UserCodeUpdate,
            Self::CompleteSnapshot { .. } => PacketKind::CompleteSnapshot,
            Self::Acknowledgement { .. } => PacketKind::Acknowledgement,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    ///
    /// The whole frame must be consumed; trailing bytes are rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (packet, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::TrailingBytes {
                consumed: read,
                total: bytes.len(),
            });
        }
        Ok(packet)
    }
}

/// Codec and framing errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Frame has {} trailing bytes after packet", .total - .consumed)]
    TrailingBytes { consumed: usize, total: usize },
    #[error("Unexpected {0} frame")]
    UnexpectedFrame(&'static str),
    #[error("Expected {expected} packet, got {actual}")]
    UnexpectedPacket {
        expected: PacketKind,
        actual: PacketKind,
    },
}
