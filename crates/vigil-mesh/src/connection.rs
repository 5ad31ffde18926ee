//! The transport seam consumed by endpoints.
//!
//! Wire encoding, framing, and handshakes live in the transport, behind the
//! [`Connection`] trait. A connection surfaces exactly two things to the
//! mesh: raw inbound values and the close of the link. The in-process
//! [`PipeConnection`] implements the trait for tests and demos.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use vigil_types::{Message, VigilError, VigilResult};

/// Traffic and lifecycle notifications from a connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A raw message arrived from the peer.
    Inbound(Value),
    /// The connection closed.
    Closed,
}

/// A live link to a peer.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Whether the transport currently considers the link up.
    fn is_connected(&self) -> bool;

    /// Send a message to the peer. Best effort; errors mean the message
    /// was not handed to the transport.
    async fn send_message(&self, message: &Message) -> VigilResult<()>;

    /// Subscribe to this connection's events.
    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;
}

/// An in-process connection pair.
///
/// Messages sent on one half surface as [`ConnectionEvent::Inbound`] on the
/// other. Closing either half closes both and notifies subscribers on each
/// side.
#[derive(Debug)]
pub struct PipeConnection {
    connected: Arc<AtomicBool>,
    inbound: broadcast::Sender<ConnectionEvent>,
    outbound: broadcast::Sender<ConnectionEvent>,
}

impl PipeConnection {
    /// Create a connected pair of halves.
    pub fn pair() -> (Arc<PipeConnection>, Arc<PipeConnection>) {
        let (a_tx, _) = broadcast::channel(64);
        let (b_tx, _) = broadcast::channel(64);
        let connected = Arc::new(AtomicBool::new(true));
        let a = Arc::new(Self {
            connected: connected.clone(),
            inbound: a_tx.clone(),
            outbound: b_tx.clone(),
        });
        let b = Arc::new(Self {
            connected,
            inbound: b_tx,
            outbound: a_tx,
        });
        (a, b)
    }

    /// Close both halves and notify subscribers on each side.
    pub fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.inbound.send(ConnectionEvent::Closed);
            let _ = self.outbound.send(ConnectionEvent::Closed);
        }
    }

    /// Push a raw value into this half, as if the peer had sent it.
    /// Bypasses message typing, so tests can deliver malformed traffic.
    pub fn inject(&self, raw: Value) {
        let _ = self.inbound.send(ConnectionEvent::Inbound(raw));
    }
}

#[async_trait]
impl Connection for PipeConnection {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_message(&self, message: &Message) -> VigilResult<()> {
        if !self.is_connected() {
            return Err(VigilError::Transport("pipe is closed".to_string()));
        }
        let _ = self.outbound.send(ConnectionEvent::Inbound(message.to_value()));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inbound.subscribe()
    }
}
