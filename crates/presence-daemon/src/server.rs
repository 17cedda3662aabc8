//! Relay server: accepts local WebSocket clients and feeds the bridge.

use crate::protocol::{ClientRequest, ServerMessage};
use anyhow::Context;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use presence_client::PresenceBridge;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// Port the relay listens on.
pub const RELAY_PORT: u16 = 36822;

/// Interval between liveness pings.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Time a session gets to send its close frame during shutdown.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Time all sessions together get to finish before they are aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

type Sink = SplitSink<WebSocketStream<TcpStream>, Message>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub heartbeat_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: ([127, 0, 0, 1], RELAY_PORT).into(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

#[derive(Debug)]
struct Running {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// Relay server with an explicit start/stop lifecycle.
#[derive(Debug)]
pub struct RelayServer {
    config: ServerConfig,
    bridge: PresenceBridge,
    running: Option<Running>,
}

impl RelayServer {
    pub fn new(config: ServerConfig, bridge: PresenceBridge) -> Self {
        Self {
            config,
            bridge,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Address the listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.addr)
    }

    /// Bind the listener and start accepting. A no-op if already running.
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        if let Some(running) = &self.running {
            return Ok(running.addr);
        }

        let listener = TcpListener::bind(self.config.listen)
            .await
            .with_context(|| format!("failed to bind relay on {}", self.config.listen))?;
        let addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            self.bridge.clone(),
            self.config.heartbeat_interval,
            shutdown.clone(),
        ));

        tracing::info!("Relay listening on ws://{}", addr);
        self.running = Some(Running {
            addr,
            shutdown,
            task,
        });
        Ok(addr)
    }

    /// Close every session, then the listener. Returns once the listener is
    /// closed.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        tracing::info!("Stopping relay on {}", running.addr);
        running.shutdown.cancel();
        if let Err(e) = running.task.await {
            tracing::error!("Relay accept loop failed: {}", e);
        }
        tracing::info!("Relay stopped");
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.shutdown.cancel();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    bridge: PresenceBridge,
    heartbeat: Duration,
    shutdown: CancellationToken,
) {
    let mut sessions = JoinSet::new();
    let mut backoff = AcceptBackoff::default();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    backoff.reset();
                    let bridge = bridge.clone();
                    let shutdown = shutdown.clone();
                    sessions.spawn(async move {
                        if let Err(e) = handle_session(stream, addr, bridge, heartbeat, shutdown).await {
                            tracing::warn!("Session error from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    // Persistent failures such as EMFILE must not spin the loop.
                    let wait = backoff.failed();
                    tracing::warn!(?wait, "Accept failed: {}", e);
                    tokio::select! {
                        () = shutdown.cancelled() => {}
                        () = time::sleep(wait) => {}
                    }
                }
            },
            Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!("Session task failed: {}", e);
                }
            }
        }
    }

    if !sessions.is_empty() {
        tracing::debug!(live = sessions.len(), "Closing relay sessions");
    }
    let drained = time::timeout(SHUTDOWN_GRACE, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!("Terminating {} sessions that did not close", sessions.len());
        sessions.shutdown().await;
    }

    drop(listener);
}

async fn handle_session(
    stream: TcpStream,
    addr: SocketAddr,
    bridge: PresenceBridge,
    heartbeat: Duration,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut stream) = ws.split();

    tracing::info!("New client connected from {}", addr);

    // A client that stops reading cannot stall the session past one interval.
    send(&mut sink, &ServerMessage::connected(), heartbeat).await?;
    send(&mut sink, &ServerMessage::ask_activity(), heartbeat).await?;

    let mut alive = true;
    let mut ticker = time::interval_at(Instant::now() + heartbeat, heartbeat);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                let _ = time::timeout(CLOSE_GRACE, sink.send(Message::Close(None))).await;
                tracing::debug!("Closed session {} for shutdown", addr);
                return Ok(());
            }

            _ = ticker.tick() => {
                if !alive {
                    tracing::warn!("Client {} missed a heartbeat, terminating", addr);
                    return Ok(());
                }
                alive = false;
                send_within(&mut sink, Message::Ping(Default::default()), heartbeat).await?;
            }

            msg = stream.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket error from {}: {}", addr, e);
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Text(text) => {
                        let reply = handle_text(&bridge, &text);
                        send(&mut sink, &reply, heartbeat).await?;
                    }
                    Message::Binary(data) => {
                        let reply = match std::str::from_utf8(&data) {
                            Ok(text) => handle_text(&bridge, text),
                            Err(_) => ServerMessage::bad_request(),
                        };
                        send(&mut sink, &reply, heartbeat).await?;
                    }
                    Message::Pong(_) => alive = true,
                    Message::Close(frame) => {
                        tracing::debug!(?frame, "Close from {}", addr);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    tracing::info!("Client disconnected: {}", addr);
    Ok(())
}

fn handle_text(bridge: &PresenceBridge, text: &str) -> ServerMessage {
    let request = match ClientRequest::parse(text) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("Failed to process message: {}", e);
            return ServerMessage::bad_request();
        }
    };

    let issued = match request {
        ClientRequest::SetActivity(activity) => bridge.set_activity(activity).map(Some),
        ClientRequest::ResetActivity => bridge.reset_activity().map(Some),
        ClientRequest::Ignored => Ok(None),
    };
    match issued {
        Ok(Some(nonce)) => tracing::debug!(%nonce, "Forwarded presence update"),
        Ok(None) => tracing::debug!("Message without a state change"),
        Err(e) => tracing::error!("Presence bridge unavailable: {}", e),
    }

    ServerMessage::ok()
}

async fn send(sink: &mut Sink, message: &ServerMessage, limit: Duration) -> anyhow::Result<()> {
    let text = serde_json::to_string(message)?;
    send_within(sink, Message::Text(text.into()), limit).await
}

async fn send_within(sink: &mut Sink, message: Message, limit: Duration) -> anyhow::Result<()> {
    match time::timeout(limit, sink.send(message)).await {
        Ok(sent) => Ok(sent?),
        Err(_) => anyhow::bail!("client not reading, send blocked for {limit:?}"),
    }
}

/// Exponential pause between failed accepts.
#[derive(Debug)]
struct AcceptBackoff {
    next: Duration,
}

impl Default for AcceptBackoff {
    fn default() -> Self {
        Self {
            next: ACCEPT_BACKOFF_MIN,
        }
    }
}

impl AcceptBackoff {
    fn failed(&mut self) -> Duration {
        let wait = self.next;
        self.next = (self.next * 2).min(ACCEPT_BACKOFF_MAX);
        wait
    }

    fn reset(&mut self) {
        self.next = ACCEPT_BACKOFF_MIN;
    }
}
