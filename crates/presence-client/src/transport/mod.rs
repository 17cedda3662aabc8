//! Transport abstraction over the two upstream protocols.

pub mod ipc;
pub mod websocket;

use crate::TransportError;
use serde_json::Value;
use tokio::sync::mpsc;

/// Which upstream protocol a transport speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Framed local IPC socket (Unix socket or Windows named pipe).
    LocalSocket,
    /// Loopback WebSocket with port probing.
    Loopback,
}

/// Lifecycle and data events of one upstream connection.
#[derive(Debug)]
pub enum TransportEvent {
    /// The connection is open and the handshake has been sent.
    Ready,
    /// A decoded JSON payload from the peer.
    Message { opcode: i32, payload: Value },
    /// A read failure or malformed payload.
    Error(TransportError),
    /// The connection is gone. Always the last event of a connection.
    Disconnected,
}

/// Capability set shared by both upstream protocols.
///
/// A transport holds at most one connection. Events of that connection are
/// pulled with [`Transport::next_event`]; connecting again or disconnecting
/// discards anything still queued from the previous connection.
#[async_trait::async_trait]
pub trait Transport: Send + 'static {
    fn kind(&self) -> TransportKind;

    /// Open a connection. `attempt` is the zero-based retry counter, used by
    /// transports that try several endpoints.
    async fn connect(&mut self, attempt: u32) -> Result<(), TransportError>;

    /// Send one JSON payload. Fails without queuing when not connected.
    async fn send(&mut self, payload: &Value) -> Result<(), TransportError>;

    /// Close the current connection, if any.
    async fn disconnect(&mut self);

    /// Wait for the next event. Pending while there is no connection.
    async fn next_event(&mut self) -> TransportEvent;
}

/// Per-connection event queue. Reader tasks push, the owner pulls.
#[derive(Debug, Default)]
pub(crate) struct EventQueue {
    rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl EventQueue {
    /// Start a fresh queue, dropping events of any previous connection.
    pub(crate) fn open(&mut self) -> mpsc::UnboundedSender<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.rx = Some(rx);
        tx
    }

    pub(crate) fn close(&mut self) {
        self.rx = None;
    }

    pub(crate) async fn next(&mut self) -> TransportEvent {
        let Some(rx) = self.rx.as_mut() else {
            return std::future::pending().await;
        };
        match rx.recv().await {
            Some(event) => event,
            None => {
                // Reader went away without reporting; treat as a drop.
                self.rx = None;
                TransportEvent::Disconnected
            }
        }
    }
}
