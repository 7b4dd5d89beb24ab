//! # codecast-sync: live code broadcast over WebSockets
//!
//! One developer publishes reference files to many users; users submit
//! their own variants back and every developer sees the aggregate.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   Credential / packets  ┌──────────────────────────┐
//! │ SyncClient  │ ◄─────────────────────► │ SyncServer               │
//! │ (reconnect) │     bincode frames      │  handshake → registry    │
//! └─────────────┘                         │  read loops → queue      │
//!                                         └────────────┬─────────────┘
//!                                                      │ tick
//!                                         ┌────────────▼─────────────┐
//!                                         │ processor (single writer)│
//!                                         │  SharedCodeStore         │
//!                                         │  BroadcastRouter fan-out │
//!                                         └──────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: `Packet` union and its bincode codec
//! - [`store`]: developer files and aggregated user submissions
//! - [`registry`]: registered connections and role-filtered fan-out
//! - [`handshake`]: role negotiation on both ends
//! - [`queue`] / [`processor`]: decoupled ingestion and the periodic tick
//! - [`broadcast`]: encode-once delivery with counters
//! - [`server`]: WebSocket server
//! - [`client`]: reconnecting WebSocket client

pub mod protocol;
pub mod error;
pub mod connection;
pub mod store;
pub mod registry;
pub mod broadcast;
pub mod queue;
pub mod hub;
pub mod handshake;
pub mod processor;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{ConnectionId, Packet, PacketKind, ProtocolError, Submissions, NO_PASSWORD};
pub use error::{ClientError, SyncError, ValidationError};
pub use connection::{Connection, Outbound, Role};
pub use store::SharedCodeStore;
pub use registry::{ConnectionRegistry, Delivery, RoleCounts};
pub use broadcast::{BroadcastRouter, BroadcastStats};
pub use queue::{PacketQueue, PendingPacket};
pub use hub::{Hub, ServerStats};
pub use handshake::Credential;
pub use processor::TickReport;
pub use server::{
    ServerConfig, SyncServer, DEFAULT_ENDPOINT_PATH, DEFAULT_HANDSHAKE_TIMEOUT,
    DEFAULT_TICK_INTERVAL, MAX_USER_CODE_ENTRIES, MAX_USER_CODE_LENGTH,
};
pub use client::{
    ClientConfig, ConnectionState, SyncClient, SyncEvent, DEFAULT_RECONNECT_DELAY,
};
