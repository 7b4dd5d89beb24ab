//! Reconnecting WebSocket client.
//!
//! Provides:
//! - One logical connection per client, retried after a fixed delay
//! - Client-side handshake (credential, then `DeveloperInit` for developers)
//! - Inbound packets forwarded to the owner as [`SyncEvent`]s
//! - Best-effort sends with no local buffering
//!
//! Session states:
//! ```text
//! Disconnected → Connecting → Handshaking → Active → Closed | Failed
//!      ▲                                                  │
//!      └────────────── reconnect delay ◄──────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

use crate::connection::{drain_after_close, Outbound};
use crate::error::{ClientError, SyncError};
use crate::handshake::{self, Credential};
use crate::protocol::{Packet, ProtocolError};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

const DISCONNECT_REASON: &str = "Client disconnected";

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Full endpoint URL, e.g. `ws://localhost:8080/connection`
    pub url: String,
    pub credential: Credential,
    /// Pause between a closed session and the next attempt
    pub reconnect_delay: Duration,
    /// Capacity of the owner's event channel
    pub event_capacity: usize,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, credential: Credential) -> Self {
        Self {
            url: url.into(),
            credential,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn user(url: impl Into<String>) -> Self {
        Self::new(url, Credential::User)
    }

    pub fn developer(
        url: impl Into<String>,
        secret: impl Into<String>,
        project_name: impl Into<String>,
    ) -> Self {
        Self::new(url, Credential::developer(secret, project_name))
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Active,
    /// The last session ended with a normal or going-away close.
    Closed,
    /// The last session ended with an error or a refusal.
    Failed,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Handshake sent; the session is live
    Connected,
    /// A packet arrived from the server
    Packet(Packet),
    /// The session ended
    Closed {
        /// Close code sent by the server, if it sent one
        code: Option<CloseCode>,
        reason: String,
        /// Set when the session ended in a local or transport error
        error: Option<String>,
        /// Whether another attempt follows after the reconnect delay
        reconnecting: bool,
    },
}

/// Connect intent. Each `connect` call starts a new generation so a loop
/// left over from an earlier call can never pick up a newer intent.
#[derive(Debug, Clone, Copy, Default)]
struct Intent {
    generation: u64,
    connected: bool,
}

/// How one session ended.
struct SessionEnd {
    code: Option<CloseCode>,
    reason: String,
    error: Option<String>,
}

impl SessionEnd {
    fn failed(error: &SyncError) -> Self {
        Self {
            code: None,
            reason: error.to_string(),
            error: Some(error.to_string()),
        }
    }

    fn is_clean(&self) -> bool {
        self.error.is_none()
            && matches!(self.code, None | Some(CloseCode::Normal) | Some(CloseCode::Away))
    }
}

#[derive(Debug)]
struct Shared {
    config: ClientConfig,
    state: RwLock<ConnectionState>,
    intent: watch::Sender<Intent>,
    /// Send path of the live session, tagged with the generation that opened it.
    session: Mutex<Option<(u64, Outbound)>>,
    events: mpsc::Sender<SyncEvent>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        let intent = *self.intent.borrow();
        intent.connected && intent.generation == generation
    }

    /// Whether `generation` is the newest, connected or not.
    fn owns(&self, generation: u64) -> bool {
        self.intent.borrow().generation == generation
    }

    /// Loops from older generations never touch the state.
    async fn set_state(&self, generation: u64, state: ConnectionState) {
        let mut current = self.state.write().await;
        if self.owns(generation) {
            *current = state;
        }
    }

    /// Forget the session if `generation` opened it.
    async fn release_session(&self, generation: u64) {
        let mut session = self.session.lock().await;
        if matches!(session.as_ref(), Some((owner, _)) if *owner == generation) {
            session.take();
        }
    }

    async fn emit(&self, event: SyncEvent) {
        // The owner may have dropped the receiver; that is not our failure.
        let _ = self.events.send(event).await;
    }
}

/// The sync client.
///
/// Owns one logical connection to the server. While connect intent is set
/// a background task keeps re-establishing the session.
pub struct SyncClient {
    shared: Arc<Shared>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        let (events, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (intent, _) = watch::channel(Intent::default());
        Self {
            shared: Arc::new(Shared {
                config,
                state: RwLock::new(ConnectionState::Disconnected),
                intent,
                session: Mutex::new(None),
                events,
            }),
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    ///
    /// Events are delivered with backpressure: an owner that stops reading
    /// stalls its own session once the channel is full.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Set connect intent and start the reconnect loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self) -> Result<(), ClientError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ClientError::Runtime(e.to_string()))?;

        let mut started = None;
        self.shared.intent.send_if_modified(|intent| {
            if intent.connected {
                return false;
            }
            intent.generation += 1;
            intent.connected = true;
            started = Some(intent.generation);
            true
        });
        let generation = started.ok_or(ClientError::AlreadyConnected)?;

        log::info!("Connecting to {}", self.shared.config.url);
        runtime.spawn(reconnect_loop(self.shared.clone(), generation));
        Ok(())
    }

    /// Clear connect intent and close the live session with going-away.
    ///
    /// The reconnect loop stops after reporting the close; a pending retry
    /// delay is cut short.
    pub async fn disconnect(&self) {
        let was_connected = self.shared.intent.send_if_modified(|intent| {
            std::mem::replace(&mut intent.connected, false)
        });
        if !was_connected {
            return;
        }
        if let Some((_, session)) = self.shared.session.lock().await.as_ref() {
            session.close(CloseCode::Away, DISCONNECT_REASON);
        }
    }

    /// Send a packet on the live session.
    ///
    /// Returns `false` without buffering when no session is live.
    pub async fn send_unsafe(&self, packet: &Packet) -> bool {
        match self.shared.session.lock().await.as_ref() {
            Some((_, session)) => match session.send_packet(packet) {
                Ok(()) => true,
                Err(e) => {
                    log::debug!("Dropped {:?}: {e}", packet.kind());
                    false
                }
            },
            None => false,
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Whether connect intent is currently set.
    pub fn wants_connection(&self) -> bool {
        self.shared.intent.borrow().connected
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.shared.intent.send_modify(|intent| intent.connected = false);
        if let Ok(session) = self.shared.session.try_lock() {
            if let Some((_, session)) = session.as_ref() {
                session.close(CloseCode::Away, DISCONNECT_REASON);
            }
        }
    }
}

async fn reconnect_loop(shared: Arc<Shared>, generation: u64) {
    let mut intent_rx = shared.intent.subscribe();

    while shared.is_current(generation) {
        let end = match run_session(&shared, generation).await {
            Ok(end) => end,
            Err(e) => SessionEnd::failed(&e),
        };

        shared.release_session(generation).await;
        let reconnecting = shared.is_current(generation);
        let state = if end.is_clean() {
            ConnectionState::Closed
        } else {
            ConnectionState::Failed
        };
        shared.set_state(generation, state).await;

        match &end.error {
            Some(error) => log::warn!("Session to {} failed: {error}", shared.config.url),
            None => log::info!("Session to {} closed: {}", shared.config.url, end.reason),
        }
        shared
            .emit(SyncEvent::Closed {
                code: end.code,
                reason: end.reason,
                error: end.error,
                reconnecting,
            })
            .await;

        if !reconnecting {
            break;
        }

        log::debug!("Reconnecting in {:?}", shared.config.reconnect_delay);
        tokio::select! {
            _ = tokio::time::sleep(shared.config.reconnect_delay) => {}
            _ = intent_rx.changed() => {}
        }
        shared
            .set_state(generation, ConnectionState::Disconnected)
            .await;
    }

    shared
        .set_state(generation, ConnectionState::Disconnected)
        .await;
}

/// One transport lifetime: connect, handshake, read until it ends.
async fn run_session(shared: &Shared, generation: u64) -> Result<SessionEnd, SyncError> {
    shared
        .set_state(generation, ConnectionState::Connecting)
        .await;
    let (ws_stream, _) = tokio_tungstenite::connect_async(shared.config.url.as_str()).await?;
    let (sink, mut stream) = ws_stream.split();
    let outbound = Outbound::spawn(sink);

    shared
        .set_state(generation, ConnectionState::Handshaking)
        .await;
    handshake::initiate(&outbound, &shared.config.credential)?;

    {
        let mut session = shared.session.lock().await;
        if shared.is_current(generation) {
            *session = Some((generation, outbound.clone()));
        } else {
            // `disconnect` ran before the session was visible to it.
            outbound.close(CloseCode::Away, DISCONNECT_REASON);
        }
    }
    shared.set_state(generation, ConnectionState::Active).await;
    shared.emit(SyncEvent::Connected).await;

    while let Some(frame) = stream.next().await {
        let packet = match frame? {
            Message::Binary(data) => Packet::decode(&data),
            Message::Text(_) => Err(ProtocolError::UnexpectedFrame("text")),
            Message::Close(frame) => {
                let (code, reason) = match frame {
                    Some(frame) => (Some(frame.code), frame.reason.as_str().to_owned()),
                    None => (None, String::new()),
                };
                let reason = if reason.is_empty() {
                    "Connection closed".to_string()
                } else {
                    reason
                };
                drain_after_close(&mut stream).await;
                return Ok(SessionEnd {
                    code,
                    reason,
                    error: None,
                });
            }
            _ => continue,
        };

        match packet {
            Ok(packet) => shared.emit(SyncEvent::Packet(packet)).await,
            Err(e) => {
                let error = SyncError::from(e);
                outbound.close(error.close_code(), error.to_string());
                return Err(error);
            }
        }
    }

    Err(SyncError::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNREACHABLE: &str = "ws://127.0.0.1:1/connection";

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::developer("ws://localhost:8080/connection", "okok", "P");
        assert_eq!(config.url, "ws://localhost:8080/connection");
        assert_eq!(config.credential, Credential::developer("okok", "P"));
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.event_capacity, 256);
        assert_eq!(ClientConfig::user("ws://x").credential, Credential::User);
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new(ClientConfig::user(UNREACHABLE));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(!client.wants_connection());
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new(ClientConfig::user(UNREACHABLE));
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_send_unsafe_without_session_fails() {
        let client = SyncClient::new(ClientConfig::user(UNREACHABLE));
        assert!(!client.send_unsafe(&Packet::acknowledgement("hi")).await);
    }

    #[test]
    fn test_connect_outside_runtime() {
        let client = SyncClient::new(ClientConfig::user(UNREACHABLE));
        assert!(matches!(client.connect(), Err(ClientError::Runtime(_))));
        assert!(!client.wants_connection());
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let mut config = ClientConfig::user(UNREACHABLE);
        config.reconnect_delay = Duration::from_millis(20);
        let client = SyncClient::new(config);

        client.connect().unwrap();
        assert_eq!(client.connect(), Err(ClientError::AlreadyConnected));
        client.disconnect().await;
        assert!(!client.wants_connection());
    }

    #[tokio::test]
    async fn test_unreachable_server_retries_until_disconnect() {
        let mut config = ClientConfig::user(UNREACHABLE);
        config.reconnect_delay = Duration::from_millis(20);
        let mut client = SyncClient::new(config);
        let mut events = client.take_event_rx().unwrap();

        client.connect().unwrap();
        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                SyncEvent::Closed {
                    error,
                    reconnecting,
                    reason,
                    ..
                } => {
                    assert!(error.is_some());
                    assert!(!reason.is_empty());
                    assert!(reconnecting);
                }
                other => panic!("expected Closed, got {other:?}"),
            }
        }

        client.disconnect().await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while client.connection_state().await != ConnectionState::Disconnected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Reconnecting after a disconnect starts a fresh loop.
        client.connect().unwrap();
        client.disconnect().await;
    }

    async fn next_event(events: &mut mpsc::Receiver<SyncEvent>) -> SyncEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    /// Peer that reads and ignores everything. Its first socket hangs up
    /// `linger` after the client's close frame, without a close reply.
    async fn lingering_peer(linger: Duration) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut first = true;
            while let Ok((stream, _)) = listener.accept().await {
                let slow = std::mem::replace(&mut first, false);
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    while let Some(Ok(msg)) = ws.next().await {
                        if slow && matches!(msg, Message::Close(_)) {
                            tokio::time::sleep(linger).await;
                            return;
                        }
                    }
                });
            }
        });
        format!("ws://{addr}/connection")
    }

    #[tokio::test]
    async fn test_late_end_of_old_session_keeps_new_session() {
        let mut config = ClientConfig::user(lingering_peer(Duration::from_millis(300)).await);
        config.reconnect_delay = Duration::from_millis(20);
        let mut client = SyncClient::new(config);
        let mut events = client.take_event_rx().unwrap();

        client.connect().unwrap();
        assert_eq!(next_event(&mut events).await, SyncEvent::Connected);
        client.disconnect().await;
        client.connect().unwrap();

        // The new session comes up; the old one reports its end later.
        let (mut connected, mut closed) = (false, false);
        while !(connected && closed) {
            match next_event(&mut events).await {
                SyncEvent::Connected => connected = true,
                SyncEvent::Closed { reconnecting, .. } => {
                    assert!(!reconnecting);
                    closed = true;
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        assert!(client.wants_connection());
        assert_eq!(client.connection_state().await, ConnectionState::Active);
        assert!(client.send_unsafe(&Packet::acknowledgement("still here")).await);
        client.disconnect().await;
    }

    #[test]
    fn test_session_end_classification() {
        let clean = SessionEnd {
            code: Some(CloseCode::Away),
            reason: "bye".into(),
            error: None,
        };
        assert!(clean.is_clean());

        let refused = SessionEnd {
            code: Some(CloseCode::Policy),
            reason: "Invalid credential".into(),
            error: None,
        };
        assert!(!refused.is_clean());
        assert!(!SessionEnd::failed(&SyncError::Closed).is_clean());
    }
}
