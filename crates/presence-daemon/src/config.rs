//! Daemon configuration: TOML file, environment and command line.

use crate::server::{RELAY_PORT, ServerConfig};
use anyhow::Context;
use clap::{Parser, ValueEnum};
use presence_client::transport::websocket::BASE_PORT;
use presence_client::{
    LocalSocketTransport, LoopbackTransport, ReconnectPolicy, Transport, TransportKind,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application id registered with the desktop client.
pub const DEFAULT_CLIENT_ID: &str = "1286301146281021440";

/// Upstream transport selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportChoice {
    #[default]
    Ipc,
    Websocket,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub client_id: String,
    pub transport: TransportChoice,
    pub listen: SocketAddr,
    pub heartbeat_secs: u64,
    /// Delay between local-socket reconnect attempts.
    pub retry_delay_ms: u64,
    /// Overrides the discovered local endpoint.
    pub ipc_path: Option<PathBuf>,
    pub websocket_base_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            transport: TransportChoice::Ipc,
            listen: ([127, 0, 0, 1], RELAY_PORT).into(),
            heartbeat_secs: 25,
            retry_delay_ms: 5000,
            ipc_path: None,
            websocket_base_port: BASE_PORT,
        }
    }
}

impl Config {
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.client_id.is_empty(), "client_id must not be empty");
        anyhow::ensure!(self.heartbeat_secs > 0, "heartbeat_secs must be positive");
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn transport_kind(&self) -> TransportKind {
        match self.transport {
            TransportChoice::Ipc => TransportKind::LocalSocket,
            TransportChoice::Websocket => TransportKind::Loopback,
        }
    }

    /// Build the upstream transport this config selects.
    pub fn transport(&self) -> Box<dyn Transport> {
        match self.transport {
            TransportChoice::Ipc => match &self.ipc_path {
                Some(path) => Box::new(LocalSocketTransport::with_path(
                    self.client_id.clone(),
                    path.clone(),
                )),
                None => Box::new(LocalSocketTransport::new(self.client_id.clone())),
            },
            TransportChoice::Websocket => Box::new(
                LoopbackTransport::new(self.client_id.clone())
                    .with_base_port(self.websocket_base_port),
            ),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        match self.transport {
            TransportChoice::Ipc => {
                ReconnectPolicy::unbounded(Duration::from_millis(self.retry_delay_ms))
            }
            TransportChoice::Websocket => ReconnectPolicy::for_kind(TransportKind::Loopback),
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen: self.listen,
            heartbeat_interval: self.heartbeat_interval(),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "presence-relay")]
#[command(version)]
#[command(about = "Relays local presence updates to the desktop client")]
pub struct Cli {
    /// TOML config file
    #[arg(long, env = "PRESENCE_RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "PRESENCE_RELAY_CLIENT_ID")]
    pub client_id: Option<String>,

    #[arg(long, value_enum, env = "PRESENCE_RELAY_TRANSPORT")]
    pub transport: Option<TransportChoice>,

    /// Relay listen address
    #[arg(long, env = "PRESENCE_RELAY_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Log filter directive, e.g. `presence_daemon=debug`
    #[arg(long, env = "PRESENCE_RELAY_LOG")]
    pub log: Option<String>,
}

impl Cli {
    /// Merge flags over the config file over defaults.
    pub fn resolve(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(client_id) = &self.client_id {
            config.client_id = client_id.clone();
        }
        if let Some(transport) = self.transport {
            config.transport = transport;
        }
        if let Some(listen) = self.listen {
            config.listen = listen;
        }

        config.validate()?;
        Ok(config)
    }
}
