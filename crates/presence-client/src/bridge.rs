//! Presence bridge: one transport, one reconnect policy, one driver task.
//!
//! [`PresenceBridge`] is a cheap handle. All transport I/O and every state
//! transition happen on a single driver task, so commands from different
//! handles reach the peer in the order they were issued.

use crate::{BridgeError, ReconnectPolicy, Transport, TransportError, TransportEvent};
use presence_core::{BridgeState, Command, Response};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{self, Instant};
use uuid::Uuid;

/// Upper bound on a single connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_CAPACITY: usize = 64;

/// Event published by the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Ready,
    Disconnected,
    Error(BridgeError),
    /// Raw message from the peer.
    Message { opcode: i32, payload: Value },
    /// The peer acknowledged a `SET_ACTIVITY` command. Not matched to a nonce.
    ActivitySet,
}

#[derive(Debug)]
enum Request {
    Connect,
    Disconnect,
    Send(Command),
}

/// Handle to a running bridge.
#[derive(Debug, Clone)]
pub struct PresenceBridge {
    requests: mpsc::UnboundedSender<Request>,
    events: broadcast::Sender<BridgeEvent>,
    state: watch::Receiver<BridgeState>,
    pid: u32,
}

impl PresenceBridge {
    /// Spawn the driver task. The bridge starts `Disconnected`; call
    /// [`connect`](Self::connect) to begin. The task ends when every handle
    /// is dropped.
    pub fn spawn(transport: Box<dyn Transport>, policy: ReconnectPolicy) -> Self {
        let (requests, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, state) = watch::channel(BridgeState::Disconnected);

        let driver = Driver {
            transport,
            policy,
            link: Link {
                state: state_tx,
                events: events.clone(),
            },
        };
        tokio::spawn(driver.run(rx));

        Self {
            requests,
            events,
            state,
            pid: std::process::id(),
        }
    }

    /// Start connecting. Ignored unless `Disconnected` or `Failed`; from
    /// `Failed` the retry budget starts over.
    pub fn connect(&self) -> Result<(), BridgeError> {
        self.request(Request::Connect)
    }

    /// Close the connection and cancel any pending retry.
    pub fn disconnect(&self) -> Result<(), BridgeError> {
        self.request(Request::Disconnect)
    }

    /// Set the presence. The activity is forwarded verbatim. Returns the
    /// nonce of the issued command; send failures arrive as
    /// [`BridgeEvent::Error`]. Nothing is held back while not connected, not
    /// even during a connect attempt.
    pub fn set_activity(&self, activity: Value) -> Result<Uuid, BridgeError> {
        self.issue(Command::set_activity(self.pid, activity))
    }

    /// Clear the presence.
    pub fn reset_activity(&self) -> Result<Uuid, BridgeError> {
        self.issue(Command::clear_activity(self.pid))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<BridgeState> {
        self.state.clone()
    }

    /// Process id stamped on every command.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn issue(&self, command: Command) -> Result<Uuid, BridgeError> {
        let nonce = command.nonce;
        self.request(Request::Send(command))?;
        Ok(nonce)
    }

    fn request(&self, request: Request) -> Result<(), BridgeError> {
        self.requests.send(request).map_err(|_| BridgeError::Closed)
    }
}

struct Driver {
    transport: Box<dyn Transport>,
    policy: ReconnectPolicy,
    link: Link,
}

/// Outward side of the driver: state and event publication.
struct Link {
    state: watch::Sender<BridgeState>,
    events: broadcast::Sender<BridgeEvent>,
}

impl Link {
    fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    fn set_state(&self, next: BridgeState) -> BridgeState {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "Bridge state changed");
        }
        previous
    }

    fn emit(&self, event: BridgeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn send_failed(&self, command: &Command, err: &TransportError) {
        tracing::warn!(nonce = %command.nonce, "Command not sent: {}", err);
        self.emit(BridgeEvent::Error(BridgeError::from(err)));
    }
}

/// How an in-flight connect attempt ended.
enum Attempt {
    Settled(Result<(), TransportError>),
    Abandoned,
    Closed,
}

impl Driver {
    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        loop {
            let running = tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request, &mut requests).await,
                    None => false,
                },
                event = self.transport.next_event() => {
                    self.handle_event(event).await;
                    true
                }
                () = self.policy.wait() => self.attempt(&mut requests).await,
            };
            if !running {
                break;
            }
        }

        self.policy.cancel();
        self.transport.disconnect().await;
        tracing::debug!("Presence bridge stopped");
    }

    /// Returns false once every handle is gone.
    async fn handle_request(
        &mut self,
        request: Request,
        requests: &mut mpsc::UnboundedReceiver<Request>,
    ) -> bool {
        match request {
            Request::Connect => {
                let current = self.link.state();
                if !current.accepts_connect() {
                    tracing::debug!(state = %current, "Connect ignored");
                    return true;
                }
                self.policy.reset();
                self.link.set_state(BridgeState::Connecting);
                return self.attempt(requests).await;
            }
            Request::Disconnect => self.disconnect().await,
            Request::Send(command) => {
                let result = match serde_json::to_value(&command) {
                    Ok(payload) => self.transport.send(&payload).await,
                    Err(e) => Err(TransportError::from(e)),
                };
                match result {
                    Ok(()) => tracing::debug!(nonce = %command.nonce, "Command sent"),
                    Err(e) => self.link.send_failed(&command, &e),
                }
            }
        }
        true
    }

    async fn disconnect(&mut self) {
        if self.policy.cancel() {
            tracing::debug!("Pending retry cancelled");
        }
        self.transport.disconnect().await;
        let previous = self.link.set_state(BridgeState::Disconnected);
        if previous != BridgeState::Disconnected {
            tracing::info!("Presence bridge disconnected");
            self.link.emit(BridgeEvent::Disconnected);
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Ready => {
                self.policy.on_connected();
                self.link.set_state(BridgeState::Ready);
                self.link.emit(BridgeEvent::Ready);
            }
            TransportEvent::Message { opcode, payload } => {
                let response = Response::from_value(&payload);
                self.link.emit(BridgeEvent::Message { opcode, payload });
                if response.is_activity_set() {
                    self.link.emit(BridgeEvent::ActivitySet);
                }
                if let Some((code, message)) = response.error() {
                    tracing::warn!(code, "Peer reported an error: {}", message);
                    self.link
                        .emit(BridgeEvent::Error(BridgeError::Application { code, message }));
                }
            }
            TransportEvent::Error(e) => {
                self.link.emit(BridgeEvent::Error(BridgeError::from(&e)));
            }
            TransportEvent::Disconnected => {
                self.transport.disconnect().await;
                tracing::info!("Upstream connection lost");
                self.link.emit(BridgeEvent::Disconnected);
                self.schedule_retry();
            }
        }
    }

    /// Run one connect attempt while still serving requests. Commands issued
    /// meanwhile fail with `NotConnected`; a disconnect drops the attempt.
    /// Returns false once every handle is gone.
    async fn attempt(&mut self, requests: &mut mpsc::UnboundedReceiver<Request>) -> bool {
        let attempt = self.policy.begin_attempt();
        let kind = self.transport.kind();
        tracing::debug!(attempt, ?kind, "Connecting upstream");

        let outcome = {
            let connect = time::timeout(CONNECT_TIMEOUT, self.transport.connect(attempt));
            tokio::pin!(connect);
            loop {
                tokio::select! {
                    result = &mut connect => {
                        break Attempt::Settled(
                            result.unwrap_or(Err(TransportError::Timeout(CONNECT_TIMEOUT))),
                        );
                    }
                    request = requests.recv() => match request {
                        Some(Request::Send(command)) => {
                            self.link.send_failed(&command, &TransportError::NotConnected);
                        }
                        Some(Request::Connect) => tracing::debug!("Connect ignored, attempt in flight"),
                        Some(Request::Disconnect) => break Attempt::Abandoned,
                        None => break Attempt::Closed,
                    },
                }
            }
        };

        match outcome {
            Attempt::Settled(Ok(())) => {}
            Attempt::Settled(Err(e)) => {
                tracing::warn!(attempt, ?kind, "Upstream connect failed: {}", e);
                self.link.emit(BridgeEvent::Error(BridgeError::from(&e)));
                self.schedule_retry();
            }
            Attempt::Abandoned => {
                tracing::debug!(attempt, "Connect attempt abandoned");
                self.disconnect().await;
            }
            Attempt::Closed => return false,
        }
        true
    }

    fn schedule_retry(&mut self) {
        match self.policy.schedule_retry(Instant::now()) {
            Some(_) => {
                tracing::debug!(
                    delay = ?self.policy.delay(),
                    attempts = self.policy.attempts(),
                    "Retry scheduled"
                );
                self.link.set_state(BridgeState::Reconnecting);
            }
            None => {
                let attempts = self.policy.attempts();
                tracing::error!(attempts, "Max reconnect attempts reached, giving up");
                self.link.set_state(BridgeState::Failed);
                self.link
                    .emit(BridgeEvent::Error(BridgeError::RetriesExhausted { attempts }));
            }
        }
    }
}
