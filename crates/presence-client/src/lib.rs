//! Upstream side of the presence relay.
//!
//! A [`Transport`] carries JSON payloads to the desktop peer, either over the
//! framed local IPC socket ([`LocalSocketTransport`]) or a loopback WebSocket
//! ([`LoopbackTransport`]). [`PresenceBridge`] owns one transport together with
//! its [`ReconnectPolicy`] and exposes the presence commands plus an event
//! stream.

mod bridge;
mod error;
mod reconnect;
pub mod transport;

pub use bridge::{BridgeEvent, PresenceBridge, CONNECT_TIMEOUT};
pub use error::{BridgeError, ProtocolError, TransportError};
pub use reconnect::{ReconnectPolicy, RetryLimit};
pub use transport::ipc::LocalSocketTransport;
pub use transport::websocket::LoopbackTransport;
pub use transport::{Transport, TransportEvent, TransportKind};

pub use presence_core::BridgeState;
