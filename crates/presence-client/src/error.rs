//! Error taxonomy for the upstream side.

use presence_core::FrameError;
use std::io;
use std::time::Duration;
use tokio_tungstenite::tungstenite;

/// Malformed data from the desktop peer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    Oversized { len: u32, max: u32 },
}

/// Failure of a transport operation. Always recoverable by reconnecting.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection refused by {endpoint}")]
    Refused { endpoint: String },
    #[error("endpoint {endpoint} not found")]
    NotFound { endpoint: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("transport is not connected")]
    NotConnected,
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl TransportError {
    /// Classify an I/O error raised while opening `endpoint`.
    pub fn connect(endpoint: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::Refused {
                endpoint: endpoint.to_string(),
            },
            io::ErrorKind::NotFound => Self::NotFound {
                endpoint: endpoint.to_string(),
            },
            _ => Self::Io(err),
        }
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(ProtocolError::Json(err))
    }
}

/// Error reported on the bridge event stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The peer rejected a command, e.g. an unknown application id.
    #[error("peer error {code}: {message}")]
    Application { code: i64, message: String },
    #[error("gave up after {attempts} connection attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("presence bridge has shut down")]
    Closed,
}

impl From<&TransportError> for BridgeError {
    fn from(err: &TransportError) -> Self {
        if err.is_protocol() {
            Self::Protocol(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_connect_errors() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(matches!(
            TransportError::connect("/tmp/x", refused),
            TransportError::Refused { .. }
        ));

        let missing = io::Error::from(io::ErrorKind::NotFound);
        assert!(matches!(
            TransportError::connect("/tmp/x", missing),
            TransportError::NotFound { .. }
        ));

        let other = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(matches!(
            TransportError::connect("/tmp/x", other),
            TransportError::Io(_)
        ));
    }

    #[test]
    fn bridge_error_keeps_category() {
        let err = TransportError::from(ProtocolError::Oversized { len: 9, max: 8 });
        assert!(matches!(BridgeError::from(&err), BridgeError::Protocol(_)));
        assert!(matches!(
            BridgeError::from(&TransportError::NotConnected),
            BridgeError::Transport(_)
        ));
    }
}
