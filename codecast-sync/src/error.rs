//! Error taxonomy shared by the server and the client.
//!
//! Every category maps onto the WebSocket close code used when the
//! offending connection is dropped.

use thiserror::Error;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::connection::Role;
use crate::protocol::{PacketKind, ProtocolError};

/// Why a user submission was refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{count} entries exceed the limit of {max}")]
    TooManyEntries { count: usize, max: usize },
    #[error("line {line} has {length} characters, limit is {max}")]
    LineTooLong {
        line: usize,
        length: usize,
        max: usize,
    },
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// Credential matched neither the public sentinel nor the secret.
    #[error("Invalid credential")]
    Authentication,
    #[error("{role} connections may not send {kind}")]
    Authorization { role: Role, kind: PacketKind },
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Transport error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Handshake timed out")]
    HandshakeTimeout,
    #[error("Connection closed")]
    Closed,
}

impl SyncError {
    /// Close code sent to the peer when this error ends its session.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::Authentication
            | Self::Authorization { .. }
            | Self::Validation(_)
            | Self::Protocol(_)
            | Self::HandshakeTimeout => CloseCode::Policy,
            Self::Transport(_) | Self::Io(_) | Self::Closed => CloseCode::Error,
        }
    }
}

/// Misuse of the client API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("Client is already connecting or connected")]
    AlreadyConnected,
    #[error("Client runtime is unavailable: {0}")]
    Runtime(String),
}
