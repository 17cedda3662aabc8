//! Relay protocol between local clients and the daemon.

use serde::Serialize;
use serde_json::Value;

/// Messages sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Status { status_code: String, message: String },
    Event { event: String },
}

impl ServerMessage {
    /// Greeting sent right after the WebSocket opens.
    pub fn connected() -> Self {
        Self::status("1488", "Connected")
    }

    /// Asks the client to push its current activity.
    pub fn ask_activity() -> Self {
        Self::Event {
            event: "ASK_ACTIVITY".to_string(),
        }
    }

    pub fn ok() -> Self {
        Self::status("200", "OK")
    }

    pub fn bad_request() -> Self {
        Self::status("400", "Bad Request")
    }

    fn status(code: &str, message: &str) -> Self {
        Self::Status {
            status_code: code.to_string(),
            message: message.to_string(),
        }
    }
}

/// A parsed client message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    /// `{"state": true, "activity": {...}}`
    SetActivity(Value),
    /// `{"state": false}`
    ResetActivity,
    /// Any other `state`; acknowledged and otherwise ignored.
    Ignored,
}

/// A client message the relay cannot act on. Answered with 400.
#[derive(Debug, thiserror::Error)]
pub enum ClientProtocolError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a JSON object")]
    NotAnObject,
    #[error("state is true but no activity was given")]
    MissingActivity,
}

impl ClientRequest {
    /// Classify one client message. Anything that is not a JSON object is
    /// rejected, including scalars and arrays that a looser reading of
    /// `data.state` would acknowledge with 200.
    pub fn parse(text: &str) -> Result<Self, ClientProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut fields) = value else {
            return Err(ClientProtocolError::NotAnObject);
        };

        match fields.get("state") {
            Some(Value::Bool(true)) => match fields.remove("activity") {
                Some(activity) if !activity.is_null() => Ok(Self::SetActivity(activity)),
                _ => Err(ClientProtocolError::MissingActivity),
            },
            Some(Value::Bool(false)) => Ok(Self::ResetActivity),
            _ => Ok(Self::Ignored),
        }
    }
}
