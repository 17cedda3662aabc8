//! Couples the relay server's lifetime to the bridge connection.

use crate::config::Config;
use crate::server::RelayServer;
use presence_client::{BridgeError, BridgeEvent, PresenceBridge};
use presence_core::BridgeState;
use std::future::Future;
use tokio::sync::broadcast::error::RecvError;

/// Run the relay until Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        transport = ?config.transport_kind(),
        client_id = %config.client_id,
        listen = %config.listen,
        "Starting presence relay"
    );

    let bridge = PresenceBridge::spawn(config.transport(), config.reconnect_policy());
    let mut server = RelayServer::new(config.server_config(), bridge.clone());

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    supervise(bridge, &mut server, shutdown).await
}

/// Connect the bridge and keep the server running exactly while the bridge
/// is ready. Returns when `shutdown` resolves, after stopping the server and
/// disconnecting the bridge.
pub async fn supervise(
    bridge: PresenceBridge,
    server: &mut RelayServer,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let mut events = bridge.subscribe();
    bridge.connect()?;
    tokio::pin!(shutdown);

    let result = loop {
        tokio::select! {
            () = &mut shutdown => {
                tracing::info!("Shutting down");
                break Ok(());
            }
            event = events.recv() => match event {
                Ok(BridgeEvent::Ready) => {
                    tracing::info!("Connected to desktop client");
                    if let Err(e) = ensure_running(server).await {
                        break Err(e);
                    }
                }
                Ok(BridgeEvent::Disconnected) => {
                    tracing::info!("Desktop client gone, relay going offline");
                    server.stop().await;
                }
                Ok(BridgeEvent::Error(BridgeError::RetriesExhausted { attempts })) => {
                    tracing::error!(attempts, "Giving up on the desktop client");
                }
                Ok(BridgeEvent::Error(e)) => tracing::debug!("Bridge error: {}", e),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Missed bridge events, resyncing");
                    let synced = match bridge.state() {
                        BridgeState::Ready => ensure_running(server).await,
                        _ => {
                            server.stop().await;
                            Ok(())
                        }
                    };
                    if let Err(e) = synced {
                        break Err(e);
                    }
                }
                Err(RecvError::Closed) => break Err(anyhow::anyhow!("presence bridge stopped")),
            }
        }
    };

    server.stop().await;
    if let Err(e) = bridge.disconnect() {
        tracing::debug!("Bridge already stopped: {}", e);
    }
    result
}

async fn ensure_running(server: &mut RelayServer) -> anyhow::Result<()> {
    if !server.is_running() {
        server.start().await?;
    }
    Ok(())
}
