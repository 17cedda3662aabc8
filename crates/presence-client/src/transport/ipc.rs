//! Framed local IPC transport.
//!
//! Connects to the desktop peer's local endpoint, sends the handshake frame and
//! then exchanges JSON frames at opcode 1. Readiness is declared as soon as the
//! handshake is written; the peer's reply is delivered as an ordinary message.

use super::{EventQueue, Transport, TransportEvent, TransportKind};
use crate::{ProtocolError, TransportError};
use presence_core::{Frame, HEADER_LEN, opcode};
use serde_json::{Value, json};
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// File name of the peer's IPC endpoint.
pub const IPC_NAME: &str = "discord-ipc-0";

/// Largest payload accepted from the peer (16 MiB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Directories searched, in order, for the IPC socket.
const RUNTIME_DIR_VARS: [&str; 4] = ["XDG_RUNTIME_DIR", "TMPDIR", "TMP", "TEMP"];

trait IpcStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> IpcStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Platform default endpoint of the desktop peer.
#[cfg(windows)]
pub fn default_endpoint() -> PathBuf {
    PathBuf::from(format!(r"\\?\pipe\{IPC_NAME}"))
}

/// Platform default endpoint of the desktop peer.
#[cfg(not(windows))]
pub fn default_endpoint() -> PathBuf {
    endpoint_from(|var| std::env::var_os(var))
}

#[cfg_attr(windows, allow(dead_code))]
fn endpoint_from(lookup: impl Fn(&str) -> Option<OsString>) -> PathBuf {
    RUNTIME_DIR_VARS
        .iter()
        .find_map(|var| lookup(var).filter(|dir| !dir.is_empty()))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(IPC_NAME)
}

#[cfg(unix)]
async fn open_stream(path: &Path) -> io::Result<Box<dyn IpcStream>> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    Ok(Box::new(stream))
}

#[cfg(windows)]
async fn open_stream(path: &Path) -> io::Result<Box<dyn IpcStream>> {
    let pipe = tokio::net::windows::named_pipe::ClientOptions::new().open(path)?;
    Ok(Box::new(pipe))
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let (_, len) = Frame::parse_header(&header);
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::Oversized {
            len,
            max: MAX_FRAME_SIZE,
        }
        .into());
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + len as usize);
    buf.extend_from_slice(&header);
    // A payload cut short by EOF is a length mismatch, reported by decode.
    (&mut *reader)
        .take(u64::from(len))
        .read_to_end(&mut buf)
        .await?;

    let frame = Frame::decode(&buf).map_err(ProtocolError::from)?;
    Ok(Some(frame))
}

/// Encode and write one frame.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await
}

/// Transport over the local IPC socket.
pub struct LocalSocketTransport {
    client_id: String,
    path: PathBuf,
    writer: Option<WriteHalf<Box<dyn IpcStream>>>,
    reader: Option<JoinHandle<()>>,
    events: EventQueue,
}

impl fmt::Debug for LocalSocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSocketTransport")
            .field("client_id", &self.client_id)
            .field("path", &self.path)
            .field("connected", &self.writer.is_some())
            .finish_non_exhaustive()
    }
}

impl LocalSocketTransport {
    /// Transport to the platform default endpoint.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self::with_path(client_id, default_endpoint())
    }

    /// Transport to an explicit endpoint.
    pub fn with_path(client_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            client_id: client_id.into(),
            path: path.into(),
            writer: None,
            reader: None,
            events: EventQueue::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send `payload` with an explicit opcode.
    pub async fn send_frame(&mut self, opcode: i32, payload: &Value) -> Result<(), TransportError> {
        let writer = self.writer.as_mut().ok_or(TransportError::NotConnected)?;
        let frame = Frame::json(opcode, payload)?;
        write_frame(writer, &frame).await?;
        Ok(())
    }

    async fn teardown(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        self.events.close();
    }
}

#[async_trait::async_trait]
impl Transport for LocalSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LocalSocket
    }

    async fn connect(&mut self, attempt: u32) -> Result<(), TransportError> {
        self.teardown().await;

        let endpoint = self.path.display().to_string();
        tracing::debug!(attempt, %endpoint, "Connecting to IPC socket");

        let stream = open_stream(&self.path)
            .await
            .map_err(|e| TransportError::connect(&endpoint, e))?;
        let (read_half, mut write_half) = tokio::io::split(stream);

        let handshake = Frame::json(
            opcode::HANDSHAKE,
            &json!({ "v": 1, "client_id": self.client_id }),
        )?;
        write_frame(&mut write_half, &handshake).await?;

        // Ready does not wait for the peer to answer the handshake.
        let events = self.events.open();
        let _ = events.send(TransportEvent::Ready);
        self.reader = Some(tokio::spawn(read_loop(read_half, events)));
        self.writer = Some(write_half);

        tracing::info!(%endpoint, "IPC socket connected");
        Ok(())
    }

    async fn send(&mut self, payload: &Value) -> Result<(), TransportError> {
        self.send_frame(opcode::FRAME, payload).await
    }

    async fn disconnect(&mut self) {
        if self.writer.is_some() {
            tracing::debug!(path = %self.path.display(), "Closing IPC socket");
        }
        self.teardown().await;
    }

    async fn next_event(&mut self) -> TransportEvent {
        self.events.next().await
    }
}

async fn read_loop(
    mut reader: ReadHalf<Box<dyn IpcStream>>,
    events: UnboundedSender<TransportEvent>,
) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => match serde_json::from_str::<Value>(&frame.payload) {
                Ok(payload) => {
                    tracing::trace!(opcode = frame.opcode, %payload, "IPC frame received");
                    let message = TransportEvent::Message {
                        opcode: frame.opcode,
                        payload,
                    };
                    if events.send(message).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    // Stream framing is intact but the peer is misbehaving; drop it.
                    tracing::warn!(opcode = frame.opcode, "IPC frame is not JSON: {}", e);
                    let _ = events.send(TransportEvent::Error(e.into()));
                    break;
                }
            },
            Ok(None) => {
                tracing::info!("IPC socket closed by peer");
                break;
            }
            Err(e) => {
                tracing::warn!("IPC read failed: {}", e);
                let _ = events.send(TransportEvent::Error(e));
                break;
            }
        }
    }
    let _ = events.send(TransportEvent::Disconnected);
}
