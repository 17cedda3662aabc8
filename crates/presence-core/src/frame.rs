//! Length-prefixed frames for the local IPC socket.
//!
//! Wire format:
//!
//! ```text
//! [i32 LE opcode] [u32 LE payload length] [payload: UTF-8 JSON text]
//! ```

use serde::Serialize;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// Opcodes understood by the desktop peer.
pub mod opcode {
    /// Initial handshake carrying the protocol version and client id.
    pub const HANDSHAKE: i32 = 0;
    /// Commands and events after the handshake.
    pub const FRAME: i32 = 1;
}

/// A single IPC frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: i32,
    pub payload: String,
}

impl Frame {
    pub fn new(opcode: i32, payload: impl Into<String>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    /// Serialize `value` as the JSON payload of a new frame.
    pub fn json<T: Serialize + ?Sized>(opcode: i32, value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(opcode, serde_json::to_string(value)?))
    }

    /// Encode into header plus payload.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.payload.as_bytes();
        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.extend_from_slice(&self.opcode.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    /// Split a header into `(opcode, payload length)`.
    pub fn parse_header(header: &[u8; HEADER_LEN]) -> (i32, u32) {
        let opcode = i32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let length = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        (opcode, length)
    }

    /// Decode exactly one frame. The buffer must hold the header and exactly
    /// the declared number of payload bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        let Some((header, rest)) = buf.split_first_chunk::<HEADER_LEN>() else {
            return Err(FrameError::Truncated { len: buf.len() });
        };
        let (opcode, declared) = Self::parse_header(header);
        let declared = declared as usize;

        if rest.len() < declared {
            return Err(FrameError::Incomplete {
                declared,
                available: rest.len(),
            });
        }
        if rest.len() > declared {
            return Err(FrameError::TrailingBytes {
                declared,
                available: rest.len(),
            });
        }

        let payload = std::str::from_utf8(rest)?;
        Ok(Self::new(opcode, payload))
    }
}

/// Error decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame header needs {HEADER_LEN} bytes, got {len}")]
    Truncated { len: usize },
    #[error("frame declares {declared} payload bytes but only {available} are present")]
    Incomplete { declared: usize, available: usize },
    #[error("frame declares {declared} payload bytes but {available} follow the header")]
    TrailingBytes { declared: usize, available: usize },
    #[error("frame payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}
