//! Loopback WebSocket transport.
//!
//! The desktop peer listens on one of ten consecutive ports starting at 6463.
//! Each connect attempt tries `base_port + attempt % 10`, so a run of
//! failures walks the whole range.

use super::{EventQueue, Transport, TransportEvent, TransportKind};
use crate::TransportError;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use presence_core::opcode;
use serde_json::Value;
use std::fmt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// First port the peer may listen on.
pub const BASE_PORT: u16 = 6463;

/// Number of consecutive ports tried.
pub const PORT_RANGE: u32 = 10;

/// Origin presented to the peer. The port matches the relay's listen port.
pub const ORIGIN_VALUE: &str = "http://localhost:36822";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport over a loopback WebSocket.
pub struct LoopbackTransport {
    client_id: String,
    host: String,
    base_port: u16,
    writer: Option<SplitSink<WsStream, Message>>,
    reader: Option<JoinHandle<()>>,
    events: EventQueue,
}

impl fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("client_id", &self.client_id)
            .field("host", &self.host)
            .field("base_port", &self.base_port)
            .field("connected", &self.writer.is_some())
            .finish_non_exhaustive()
    }
}

impl LoopbackTransport {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            host: "localhost".to_string(),
            base_port: BASE_PORT,
            writer: None,
            reader: None,
            events: EventQueue::default(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_base_port(mut self, port: u16) -> Self {
        self.base_port = port;
        self
    }

    /// Port tried on the given zero-based attempt.
    pub fn port_for(&self, attempt: u32) -> u16 {
        self.base_port.wrapping_add((attempt % PORT_RANGE) as u16)
    }

    pub fn url_for(&self, attempt: u32) -> String {
        format!(
            "ws://{}:{}/?v=1&client_id={}&encoding=json",
            self.host,
            self.port_for(attempt),
            self.client_id
        )
    }

    async fn teardown(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.send(Message::Close(None)).await;
            let _ = writer.close().await;
        }
        self.events.close();
    }
}

fn connect_error(url: &str, err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Io(io) => TransportError::connect(url, io),
        other => TransportError::WebSocket(other),
    }
}

#[async_trait::async_trait]
impl Transport for LoopbackTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Loopback
    }

    async fn connect(&mut self, attempt: u32) -> Result<(), TransportError> {
        self.teardown().await;

        let url = self.url_for(attempt);
        tracing::debug!(attempt, %url, "Connecting to loopback WebSocket");

        let mut request = url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(ORIGIN, HeaderValue::from_static(ORIGIN_VALUE));

        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| connect_error(&url, e))?;
        let (sink, stream) = ws.split();

        let events = self.events.open();
        let _ = events.send(TransportEvent::Ready);
        self.reader = Some(tokio::spawn(read_loop(stream, events)));
        self.writer = Some(sink);

        tracing::info!(port = self.port_for(attempt), "Loopback WebSocket connected");
        Ok(())
    }

    async fn send(&mut self, payload: &Value) -> Result<(), TransportError> {
        let Some(writer) = self.writer.as_mut() else {
            tracing::warn!("WebSocket is not open, dropping payload");
            return Err(TransportError::NotConnected);
        };
        let text = serde_json::to_string(payload)?;
        writer.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.writer.is_some() {
            tracing::debug!("Closing loopback WebSocket");
        }
        self.teardown().await;
    }

    async fn next_event(&mut self) -> TransportEvent {
        self.events.next().await
    }
}

async fn read_loop(mut stream: SplitStream<WsStream>, events: UnboundedSender<TransportEvent>) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                Ok(payload) => {
                    tracing::trace!(%payload, "WebSocket message received");
                    let message = TransportEvent::Message {
                        opcode: opcode::FRAME,
                        payload,
                    };
                    if events.send(message).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    // Keep the connection; one bad message is not fatal here.
                    tracing::warn!("Invalid JSON from peer: {}", e);
                    let _ = events.send(TransportEvent::Error(e.into()));
                }
            },
            Ok(Message::Close(frame)) => {
                tracing::info!(?frame, "WebSocket closed by peer");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("WebSocket read failed: {}", e);
                let _ = events.send(TransportEvent::Error(e.into()));
                break;
            }
        }
    }
    let _ = events.send(TransportEvent::Disconnected);
}
