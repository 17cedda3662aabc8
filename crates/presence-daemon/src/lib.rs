//! Presence relay daemon.
//!
//! Local clients connect over a loopback WebSocket and push presence updates;
//! the relay forwards them through a single [`PresenceBridge`] to the desktop
//! peer. The relay only listens while the bridge is connected.
//!
//! [`PresenceBridge`]: presence_client::PresenceBridge

mod config;
mod protocol;
mod server;
mod supervisor;

pub use config::{Cli, Config, DEFAULT_CLIENT_ID, TransportChoice};
pub use protocol::{ClientProtocolError, ClientRequest, ServerMessage};
pub use server::{HEARTBEAT_INTERVAL, RELAY_PORT, RelayServer, ServerConfig};
pub use supervisor::{run, supervise};
