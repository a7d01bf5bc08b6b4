use std::{path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::error::Error;

pub const DEFAULT_CONFIG_PATH: &str = "~/.rheovoice/engine.toml";

/// Process configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    pub engine: EngineConfig,
    #[serde(default)]
    pub turn: TurnConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EngineConfig {
    /// The only network interface ICE is allowed to use.
    pub interface: String,
    /// Externally reachable address announced as the host candidate. When omitted the first address of `interface` is used.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TurnConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_port")]
    pub port: u16,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            port: default_rpc_port(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_rpc_port() -> u16 {
    7000
}

impl Configuration {
    /// Reads and parses the file at `path`. A leading `~/` is expanded to the home directory.
    pub fn load(path: &str) -> Result<Self, Error> {
        let path = expand_home(path);
        tracing::info!("Loading configuration from {}", path.display());
        let content = std::fs::read_to_string(&path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, Error> {
        let config = toml::from_str(content)?;
        Ok(config)
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}

/// Timing and queue sizes for a [`crate::peer::Peer`] and its relay tasks.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Give up on a peer which does not deliver an inbound track within this period.
    pub connection_timeout: Duration,
    /// Close an active peer whose inbound track stays silent for this period.
    pub read_timeout: Duration,
    /// Upper bound for queueing a NACK request and for writing a NACK to the client.
    pub nack_timeout: Duration,
    /// How often pending losses are re-checked when no new loss arrives.
    pub loss_poll_interval: Duration,
    pub ingest_queue_size: usize,
    pub nack_queue_size: usize,
    /// Capacity of the per-publisher fan-out channel.
    pub fanout_queue_size: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            nack_timeout: Duration::from_secs(3),
            loss_poll_interval: Duration::from_millis(100),
            ingest_queue_size: 48000,
            nack_queue_size: 16,
            fanout_queue_size: 1024,
        }
    }
}
