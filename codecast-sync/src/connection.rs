//! Per-connection identity, role, and outbound send path.
//!
//! Each socket gets one writer task that drains an unbounded channel into
//! the WebSocket sink. Everything else (handshake replies, broadcasts,
//! kicks) only ever pushes onto that channel, so sends never block the
//! caller and a dead peer cannot stall anyone else.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Bytes, Message};

use crate::error::SyncError;
use crate::protocol::{ConnectionId, Packet};

/// Role negotiated during the handshake.
///
/// A connection that has not finished its handshake has no role yet and is
/// never represented by a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Developer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => f.write_str("User"),
            Self::Developer => f.write_str("Developer"),
        }
    }
}

/// Handle to a socket's writer task.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Message>,
}

impl Outbound {
    /// Create a detached handle and the receiving end of its queue.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Spawn a writer task that forwards queued messages into `sink`.
    ///
    /// The task stops after writing a close frame, on the first sink error,
    /// or once every handle has been dropped. The sink is then closed so
    /// the frame is flushed.
    pub fn spawn<S>(mut sink: S) -> Self
    where
        S: Sink<Message> + Unpin + Send + 'static,
        S::Error: fmt::Display,
    {
        let (outbound, mut rx) = Self::channel();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    log::debug!("Writer stopped: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
            // Handles observe `closed()` without waiting on the flush.
            drop(rx);
            let _ = tokio::time::timeout(CLOSE_GRACE, sink.close()).await;
        });
        outbound
    }

    /// Queue one encoded packet. Returns `false` if the writer is gone.
    pub fn send_bytes(&self, bytes: Bytes) -> bool {
        self.tx.send(Message::Binary(bytes)).is_ok()
    }

    pub fn send_packet(&self, packet: &Packet) -> Result<(), SyncError> {
        let encoded = packet.encode()?;
        if self.send_bytes(encoded.into()) {
            Ok(())
        } else {
            Err(SyncError::Closed)
        }
    }

    /// Queue a close frame; anything queued before it is still delivered.
    pub fn close(&self, code: CloseCode, reason: impl Into<String>) {
        let frame = CloseFrame {
            code,
            reason: close_reason(reason.into()).into(),
        };
        let _ = self.tx.send(Message::Close(Some(frame)));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the writer task has stopped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Close reasons must fit a control frame alongside the 2-byte code.
const MAX_CLOSE_REASON: usize = 123;

/// How long a closing socket waits for the peer's side of the close.
pub(crate) const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Keep reading after a close frame so the close reply gets flushed,
/// until the peer hangs up or the grace runs out.
pub(crate) async fn drain_after_close<S>(stream: &mut S)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let drain = async { while let Some(Ok(_)) = stream.next().await {} };
    let _ = tokio::time::timeout(CLOSE_GRACE, drain).await;
}

fn close_reason(mut reason: String) -> String {
    if reason.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}

/// A connection that completed its handshake.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    role: Role,
    outbound: Outbound,
    kicked: AtomicBool,
}

impl Connection {
    pub fn new(id: ConnectionId, role: Role, outbound: Outbound) -> Self {
        Self {
            id,
            role,
            outbound,
            kicked: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_developer(&self) -> bool {
        self.role == Role::Developer
    }

    pub fn send(&self, packet: &Packet) -> Result<(), SyncError> {
        self.outbound.send_packet(packet)
    }

    /// Queue pre-encoded bytes (shared across a broadcast).
    pub fn send_bytes(&self, bytes: Bytes) -> bool {
        self.outbound.send_bytes(bytes)
    }

    /// Close this connection with a policy-violation code.
    ///
    /// Only the first kick sends a close frame; packets that were already
    /// queued from this connection are skipped afterwards. Returns whether
    /// this call did the kicking.
    pub fn kick(&self, reason: impl Into<String>) -> bool {
        if self.kicked.swap(true, Ordering::AcqRel) {
            return false;
        }
        let reason = reason.into();
        log::warn!("Kicking {self}: {reason}");
        self.outbound.close(CloseCode::Policy, reason);
        true
    }

    pub fn is_kicked(&self) -> bool {
        self.kicked.load(Ordering::Acquire)
    }

    pub fn close(&self, code: CloseCode, reason: impl Into<String>) {
        self.outbound.close(code, reason);
    }

    /// Resolves once nothing more can be written to this connection.
    pub async fn closed(&self) {
        self.outbound.closed().await
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            Role::Developer => write!(f, "#{} (Developer)", self.id),
            Role::User => write!(f, "#{}", self.id),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Channel-backed connection for exercising the hub without sockets.
    pub(crate) fn test_connection(
        id: ConnectionId,
        role: Role,
    ) -> (std::sync::Arc<Connection>, mpsc::UnboundedReceiver<Message>) {
        let (outbound, rx) = Outbound::channel();
        (std::sync::Arc::new(Connection::new(id, role, outbound)), rx)
    }

    /// Decode every binary frame queued so far.
    pub(crate) fn drain_packets(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Message::Binary(data) = msg {
                packets.push(Packet::decode(&data).unwrap());
            }
        }
        packets
    }

    /// Close code of the first close frame queued, if any.
    pub(crate) fn close_code(rx: &mut mpsc::UnboundedReceiver<Message>) -> Option<CloseCode> {
        while let Ok(msg) = rx.try_recv() {
            if let Message::Close(frame) = msg {
                return frame.map(|f| f.code);
            }
        }
        None
    }

    #[test]
    fn test_send_queues_binary_frame() {
        let (conn, mut rx) = test_connection(7, Role::User);
        conn.send(&Packet::acknowledgement("hi")).unwrap();
        assert_eq!(drain_packets(&mut rx), vec![Packet::acknowledgement("hi")]);
    }

    #[test]
    fn test_kick_queues_policy_close() {
        let (conn, mut rx) = test_connection(1, Role::Developer);
        assert!(conn.kick("bad packet"));
        assert!(!conn.kick("second reason"));
        assert!(conn.is_kicked());
        assert_eq!(close_code(&mut rx), Some(CloseCode::Policy));
        assert_eq!(close_code(&mut rx), None);
    }

    #[test]
    fn test_send_after_receiver_dropped_fails() {
        let (conn, rx) = test_connection(2, Role::User);
        drop(rx);
        assert!(matches!(
            conn.send(&Packet::acknowledgement("x")),
            Err(SyncError::Closed)
        ));
        assert!(!conn.send_bytes(Bytes::from_static(b"x")));
    }

    #[test]
    fn test_close_reason_truncated_on_char_boundary() {
        let reason = close_reason("é".repeat(100));
        assert!(reason.len() <= MAX_CLOSE_REASON);
        assert_eq!(reason.chars().count(), 61);
        assert_eq!(close_reason("short".into()), "short");
    }

    #[test]
    fn test_display_marks_developers() {
        let (dev, _rx1) = test_connection(3, Role::Developer);
        let (user, _rx2) = test_connection(4, Role::User);
        assert_eq!(dev.to_string(), "#3 (Developer)");
        assert_eq!(user.to_string(), "#4");
        assert!(dev.is_developer());
        assert!(!user.is_developer());
    }

    #[tokio::test]
    async fn test_writer_stops_after_close() {
        let (sink_tx, mut sink_rx) = futures_channel::mpsc::unbounded::<Message>();
        let outbound = Outbound::spawn(sink_tx);
        outbound.send_packet(&Packet::acknowledgement("a")).unwrap();
        outbound.close(CloseCode::Away, "bye");
        outbound.send_packet(&Packet::acknowledgement("late")).ok();

        use futures_util::StreamExt;
        assert!(matches!(sink_rx.next().await, Some(Message::Binary(_))));
        assert!(matches!(sink_rx.next().await, Some(Message::Close(_))));
        // Writer exits after the close frame and drops the sink.
        assert!(sink_rx.next().await.is_none());
    }
}
