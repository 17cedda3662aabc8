//! Core types for the presence relay.
//!
//! This crate provides the wire primitives shared by the upstream bridge and
//! the downstream relay: the length-prefixed IPC frame codec, the command and
//! response envelopes exchanged with the desktop peer, and the activity record.
//! It has no async runtime; transports live in `presence-client`.

mod activity;
mod command;
mod frame;

pub use activity::{ActivityRecord, Assets, Button, Emoji, Party, Secrets, Timestamps};
pub use command::{Command, CommandArgs, Response, SET_ACTIVITY};
pub use frame::{Frame, FrameError, HEADER_LEN, opcode};

use std::fmt;

/// Lifecycle state of the upstream bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Not connected and no retry pending.
    Disconnected,
    /// First connection attempt in flight.
    Connecting,
    /// Handshake sent; commands may flow.
    Ready,
    /// Connection lost, a retry is scheduled.
    Reconnecting,
    /// Retry budget exhausted. Only an explicit connect leaves this state.
    Failed,
}

impl BridgeState {
    /// Whether an explicit connect request may start a new attempt.
    pub fn accepts_connect(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}
