//! Relay sessions end to end: WebSocket client -> relay -> bridge -> IPC peer.

#![cfg(unix)]

use futures_util::{SinkExt, StreamExt};
use presence_client::transport::ipc::{IPC_NAME, read_frame};
use presence_client::{BridgeState, LocalSocketTransport, PresenceBridge, ReconnectPolicy};
use presence_core::opcode;
use presence_daemon::{RelayServer, ServerConfig, supervise};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream, UnixListener, UnixStream};
use tokio::sync::oneshot;
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const WAIT: Duration = Duration::from_secs(5);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Simulated desktop client on a Unix socket.
struct Peer {
    listener: UnixListener,
    path: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

impl Peer {
    fn bind() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(IPC_NAME);
        let listener = UnixListener::bind(&path).unwrap();
        Self {
            listener,
            path,
            _dir: dir,
        }
    }

    fn bridge(&self) -> PresenceBridge {
        PresenceBridge::spawn(
            Box::new(LocalSocketTransport::with_path("42", &self.path)),
            ReconnectPolicy::unbounded(Duration::from_millis(50)),
        )
    }

    /// Accept the bridge and consume its handshake.
    async fn accept(&self) -> UnixStream {
        let (mut stream, _) = timeout(WAIT, self.listener.accept()).await.unwrap().unwrap();
        let (op, _) = next_frame(&mut stream).await;
        assert_eq!(op, opcode::HANDSHAKE);
        stream
    }
}

async fn next_frame(stream: &mut UnixStream) -> (i32, Value) {
    let frame = timeout(WAIT, read_frame(stream)).await.unwrap().unwrap().unwrap();
    (frame.opcode, serde_json::from_str(&frame.payload).unwrap())
}

struct Relay {
    server: RelayServer,
    addr: SocketAddr,
    upstream: UnixStream,
    _bridge: PresenceBridge,
    _peer: Peer,
}

async fn relay(heartbeat: Duration) -> Relay {
    let peer = Peer::bind();
    let bridge = peer.bridge();
    bridge.connect().unwrap();
    let upstream = peer.accept().await;
    let mut state = bridge.watch_state();
    timeout(WAIT, state.wait_for(|s| *s == BridgeState::Ready))
        .await
        .unwrap()
        .unwrap();

    let config = ServerConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        heartbeat_interval: heartbeat,
    };
    let mut server = RelayServer::new(config, bridge.clone());
    let addr = server.start().await.unwrap();
    Relay {
        server,
        addr,
        upstream,
        _bridge: bridge,
        _peer: peer,
    }
}

async fn client(addr: SocketAddr) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();
    ws
}

async fn next_json(ws: &mut Client) -> Value {
    loop {
        let msg = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send_json(ws: &mut Client, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Client that has read the greeting.
async fn greeted(addr: SocketAddr) -> Client {
    let mut ws = client(addr).await;
    assert_eq!(
        next_json(&mut ws).await,
        json!({"status_code": "1488", "message": "Connected"})
    );
    assert_eq!(next_json(&mut ws).await, json!({"event": "ASK_ACTIVITY"}));
    ws
}

/// Read until the server closes the session.
async fn wait_closed(ws: &mut Client) {
    loop {
        match timeout(WAIT, ws.next()).await.expect("session still open") {
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(_)) => {}
        }
    }
}

fn ok() -> Value {
    json!({"status_code": "200", "message": "OK"})
}

#[tokio::test]
async fn set_activity_reaches_peer() {
    let mut relay = relay(Duration::from_secs(25)).await;
    let mut ws = greeted(relay.addr).await;

    let activity = json!({
        "details": "Editing main.rs",
        "assets": {"large_image": "rust"},
        "type": 0,
        "name": "Editor"
    });
    send_json(&mut ws, json!({"state": true, "activity": activity.clone()})).await;
    assert_eq!(next_json(&mut ws).await, ok());

    let (op, command) = next_frame(&mut relay.upstream).await;
    assert_eq!(op, opcode::FRAME);
    assert_eq!(command["cmd"], "SET_ACTIVITY");
    assert_eq!(command["args"]["pid"], std::process::id());
    assert_eq!(command["args"]["activity"], activity);
    let nonce = uuid::Uuid::parse_str(command["nonce"].as_str().unwrap()).unwrap();
    assert_eq!(nonce.get_version_num(), 4);

    // Exactly one command per client message.
    assert!(
        timeout(Duration::from_millis(300), read_frame(&mut relay.upstream))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn state_false_clears_activity() {
    let mut relay = relay(Duration::from_secs(25)).await;
    let mut ws = greeted(relay.addr).await;

    send_json(&mut ws, json!({"state": false})).await;
    assert_eq!(next_json(&mut ws).await, ok());

    let (_, command) = next_frame(&mut relay.upstream).await;
    assert_eq!(command["cmd"], "SET_ACTIVITY");
    assert!(command["args"].get("activity").is_none());
}

#[tokio::test]
async fn malformed_message_gets_400_and_session_survives() {
    let mut relay = relay(Duration::from_secs(25)).await;
    let mut ws = greeted(relay.addr).await;

    ws.send(Message::Text("not-json".into())).await.unwrap();
    assert_eq!(
        next_json(&mut ws).await,
        json!({"status_code": "400", "message": "Bad Request"})
    );

    send_json(&mut ws, json!({"state": false})).await;
    assert_eq!(next_json(&mut ws).await, ok());
    let (_, command) = next_frame(&mut relay.upstream).await;
    assert_eq!(command["cmd"], "SET_ACTIVITY");
}

#[tokio::test]
async fn silent_client_is_terminated() {
    let relay = relay(Duration::from_millis(100)).await;
    let mut ws = client(relay.addr).await;

    // Not polling means no pong goes back.
    sleep(Duration::from_millis(400)).await;
    wait_closed(&mut ws).await;
}

#[tokio::test]
async fn responsive_client_survives_heartbeats() {
    let relay = relay(Duration::from_millis(100)).await;
    let mut ws = greeted(relay.addr).await;

    // Reading lets the client answer pings.
    let deadline = Instant::now() + Duration::from_millis(600);
    loop {
        match timeout_at(deadline, ws.next()).await {
            Err(_) => break,
            Ok(Some(Ok(_))) => {}
            Ok(other) => panic!("session ended early: {other:?}"),
        }
    }

    send_json(&mut ws, json!({"state": false})).await;
    assert_eq!(next_json(&mut ws).await, ok());
}

#[tokio::test]
async fn flooding_client_that_never_reads_is_terminated() {
    let relay = relay(Duration::from_millis(200)).await;

    let socket = TcpSocket::new_v4().unwrap();
    socket.set_recv_buffer_size(4096).unwrap();
    let stream = socket.connect(relay.addr).await.unwrap();
    let (mut ws, _) = tokio_tungstenite::client_async(format!("ws://{}", relay.addr), stream)
        .await
        .unwrap();

    // Every request earns a reply the client never reads, so the relay's
    // send side eventually backs up.
    let request = json!({"state": "noop"}).to_string();
    let flood = tokio::spawn(async move {
        loop {
            if ws.send(Message::Text(request.clone().into())).await.is_err() {
                return;
            }
        }
    });

    timeout(Duration::from_secs(30), flood)
        .await
        .expect("session outlived its heartbeat")
        .unwrap();
}

#[tokio::test]
async fn stop_closes_sessions_and_frees_port() {
    let mut relay = relay(Duration::from_secs(25)).await;
    let mut first = greeted(relay.addr).await;
    let mut second = greeted(relay.addr).await;

    relay.server.stop().await;
    assert!(!relay.server.is_running());
    assert!(relay.server.local_addr().is_none());

    wait_closed(&mut first).await;
    wait_closed(&mut second).await;
    TcpListener::bind(relay.addr).await.unwrap();
}

#[tokio::test]
async fn supervisor_follows_bridge() {
    let addr = {
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        reserved.local_addr().unwrap()
    };

    let peer = Peer::bind();
    let bridge = peer.bridge();
    let config = ServerConfig {
        listen: addr,
        heartbeat_interval: Duration::from_secs(25),
    };
    let server = RelayServer::new(config, bridge.clone());
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let supervisor = tokio::spawn(async move {
        let mut server = server;
        supervise(bridge, &mut server, async {
            let _ = stop_rx.await;
        })
        .await
    });

    // Bridge ready: the relay comes up.
    let upstream = peer.accept().await;
    let mut ws = connect_with_retry(addr).await;
    next_json(&mut ws).await;

    // Peer gone: the relay closes its sessions.
    drop(upstream);
    wait_closed(&mut ws).await;

    // The bridge reconnects and the relay is back.
    let _upstream = peer.accept().await;
    let mut ws = connect_with_retry(addr).await;
    assert_eq!(
        next_json(&mut ws).await,
        json!({"status_code": "1488", "message": "Connected"})
    );

    stop_tx.send(()).unwrap();
    timeout(WAIT, supervisor).await.unwrap().unwrap().unwrap();
    wait_closed(&mut ws).await;
}

async fn connect_with_retry(addr: SocketAddr) -> Client {
    let deadline = Instant::now() + WAIT;
    loop {
        match tokio_tungstenite::connect_async(format!("ws://{addr}")).await {
            Ok((ws, _)) => return ws,
            Err(_) if Instant::now() < deadline => sleep(Duration::from_millis(20)).await,
            Err(e) => panic!("relay never came up: {e}"),
        }
    }
}
