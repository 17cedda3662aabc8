//! Upstream command and response envelopes.
//!
//! Commands are sent once and never retained; responses are matched by shape
//! only (`cmd` + `evt`), not by nonce.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Command name for setting or clearing the presence.
pub const SET_ACTIVITY: &str = "SET_ACTIVITY";

/// A command sent to the desktop peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub cmd: String,
    pub args: CommandArgs,
    /// Random v4 identifier, serialized in hyphenated form.
    pub nonce: Uuid,
}

/// Arguments of a `SET_ACTIVITY` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandArgs {
    pub pid: u32,
    /// Omitted entirely when clearing the presence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<Value>,
}

impl Command {
    /// Set the presence of `pid` to `activity`, forwarded verbatim.
    pub fn set_activity(pid: u32, activity: Value) -> Self {
        Self::new(pid, Some(activity))
    }

    /// Clear the presence of `pid`.
    pub fn clear_activity(pid: u32) -> Self {
        Self::new(pid, None)
    }

    fn new(pid: u32, activity: Option<Value>) -> Self {
        Self {
            cmd: SET_ACTIVITY.to_string(),
            args: CommandArgs { pid, activity },
            nonce: Uuid::new_v4(),
        }
    }
}

/// An inbound message from the desktop peer.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub evt: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl Response {
    /// Interpret a decoded payload. Payloads that do not have the envelope
    /// shape yield an empty response.
    pub fn from_value(value: &Value) -> Self {
        Self::deserialize(value).unwrap_or_default()
    }

    /// The peer acknowledged a `SET_ACTIVITY` command.
    pub fn is_activity_set(&self) -> bool {
        self.cmd.as_deref() == Some(SET_ACTIVITY) && self.evt.as_deref() == Some("SUCCESS")
    }

    /// Error code and message if the peer reported a failure.
    pub fn error(&self) -> Option<(i64, String)> {
        if self.evt.as_deref() != Some("ERROR") {
            return None;
        }
        let data = self.data.as_ref();
        let code = data
            .and_then(|d| d.get("code"))
            .and_then(Value::as_i64)
            .unwrap_or_default();
        let message = data
            .and_then(|d| d.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        Some((code, message))
    }
}
