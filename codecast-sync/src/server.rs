//! WebSocket server: accept, negotiate, register, read.
//!
//! Architecture:
//! ```text
//! TcpListener ── accept ──► upgrade (endpoint path only)
//!                              │
//!                              ├── writer task ◄── Outbound channel
//!                              │
//!                              ├── handshake ──► admit (snapshot + register)
//!                              │
//!                              └── read loop ──► PacketQueue
//!
//! processing loop (one per server) ──tick──► SharedCodeStore + BroadcastRouter
//! ```
//!
//! Every connection runs in its own task; a failure in one never reaches
//! the others or the processing loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::connection::{drain_after_close, Connection, Outbound};
use crate::error::SyncError;
use crate::handshake;
use crate::hub::{Hub, ServerStats};
use crate::processor;
use crate::protocol::{Packet, ProtocolError};

/// Maximum number of lines in one user submission.
pub const MAX_USER_CODE_ENTRIES: usize = 10;
/// Maximum characters per submitted line.
pub const MAX_USER_CODE_LENGTH: usize = 5000;
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_ENDPOINT_PATH: &str = "/connection";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Only upgrade requests for this path are accepted
    pub endpoint_path: String,
    /// Developer credential; empty disables developer logins
    pub developer_secret: String,
    pub max_submission_entries: usize,
    pub max_line_length: usize,
    /// Processing loop period
    pub tick_interval: Duration,
    /// Limit for the credential exchange
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            endpoint_path: DEFAULT_ENDPOINT_PATH.to_string(),
            developer_secret: String::new(),
            max_submission_entries: MAX_USER_CODE_ENTRIES,
            max_line_length: MAX_USER_CODE_LENGTH,
            tick_interval: DEFAULT_TICK_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The sync server.
pub struct SyncServer {
    hub: Arc<Hub>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            hub: Arc::new(Hub::new(config)),
        }
    }

    /// Shorthand for a server that accepts developers with `secret`.
    pub fn with_secret(bind_addr: impl Into<String>, secret: impl Into<String>) -> Self {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            developer_secret: secret.into(),
            ..ServerConfig::default()
        })
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), SyncError> {
        let listener = TcpListener::bind(&self.hub.config().bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    ///
    /// The processing loop lives as long as this future.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SyncError> {
        let local = listener.local_addr()?;
        if self.hub.config().developer_secret.is_empty() {
            log::warn!("No developer secret configured; developer logins are disabled");
        }
        log::info!(
            "Sync server listening on ws://{local}{}",
            self.hub.config().endpoint_path
        );

        let _processing = AbortOnDrop(processor::spawn(self.hub.clone()));

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Failed to accept connection: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(hub, stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn bind_addr(&self) -> &str {
        &self.hub.config().bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        self.hub.stats().await
    }
}

/// Upgrade a TCP stream, refusing requests for any other path.
async fn handle_connection(
    hub: Arc<Hub>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), SyncError> {
    let endpoint = hub.config().endpoint_path.clone();
    let check_path = move |request: &Request, response: Response| {
        if request.uri().path() == endpoint {
            Ok(response)
        } else {
            let mut refusal = ErrorResponse::new(Some("Not found".to_string()));
            *refusal.status_mut() = StatusCode::NOT_FOUND;
            Err(refusal)
        }
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, check_path).await?;
    log::debug!("WebSocket connection established from {addr}");
    serve_socket(hub, ws_stream).await
}

/// Run one upgraded socket from handshake to close.
pub async fn serve_socket<S>(hub: Arc<Hub>, ws_stream: WebSocketStream<S>) -> Result<(), SyncError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, mut stream) = ws_stream.split();
    let outbound = Outbound::spawn(sink);
    let id = hub.next_connection_id();

    let negotiated = tokio::time::timeout(
        hub.config().handshake_timeout,
        handshake::negotiate(&mut stream, &hub.config().developer_secret),
    )
    .await
    .unwrap_or(Err(SyncError::HandshakeTimeout));

    let negotiated = match negotiated {
        Ok(negotiated) => negotiated,
        Err(e) => {
            hub.record_rejected_handshake();
            log::warn!("Rejected connection #{id}: {e}");
            outbound.close(e.close_code(), e.to_string());
            drain_after_close(&mut stream).await;
            return Ok(());
        }
    };

    let connection = handshake::admit(&hub, id, &negotiated, outbound).await?;
    read_loop(&hub, &connection, &mut stream).await;

    hub.registry().remove(id).await;
    log::info!("Connection {connection} closed");
    Ok(())
}

/// Queue every inbound packet until the socket closes or we close it.
async fn read_loop<S>(hub: &Hub, connection: &Arc<Connection>, stream: &mut S)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Binary(data))) => match Packet::decode(&data) {
                    Ok(packet) => hub.queue().push(connection.clone(), packet).await,
                    Err(e) => hub.kick(connection, &SyncError::from(e)),
                },
                Some(Ok(Message::Text(_))) => {
                    hub.kick(connection, &ProtocolError::UnexpectedFrame("text").into());
                }
                Some(Ok(Message::Close(frame))) => {
                    log::debug!("{connection} sent close: {frame:?}");
                    drain_after_close(stream).await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("Transport error on {connection}: {e}");
                    break;
                }
                None => break,
            },

            // We wrote a close frame (kick) or the writer died.
            _ = connection.closed() => {
                drain_after_close(stream).await;
                break;
            }
        }
    }
}
