//! Node configuration
//!
//! Plain defaults, optionally overridden from a JSON file and then from the
//! command line.

use crate::network::ban::DEFAULT_BAN_DURATION;
use crate::network::message::MAX_HEADERS_PER_REQUEST;
use crate::network::server::ServerConfig;
use crate::network::transport::SeedNode;
use crate::sync::{FetcherConfig, SyncConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid bootnode '{0}', expected <id>@<host>:<port>")]
    InvalidBootnode(String),
    #[error("A transport is required")]
    MissingTransport,
    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// Node settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Port to listen on
    pub port: u16,
    /// Seed nodes as `<hex id>@<host>:<port>`
    pub bootnodes: Vec<String>,
    /// Peers needed before syncing starts
    pub min_peers: usize,
    /// Pool capacity
    pub max_peers: usize,
    /// Sync loop interval in milliseconds
    pub interval_ms: u64,
    /// Protocol request timeout in milliseconds
    pub timeout_ms: u64,
    /// Default ban duration in milliseconds
    pub ban_duration_ms: u64,
    pub network_id: u64,
    /// Blocks per fetch request
    pub max_per_request: u64,
    /// Fetch requests in flight at once
    pub max_outstanding: usize,
    /// Requests per batch before giving up
    pub fetch_attempts: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let fetcher = FetcherConfig::default();
        Self {
            port: 30303,
            bootnodes: Vec::new(),
            min_peers: 3,
            max_peers: 25,
            interval_ms: 1000,
            timeout_ms: 5000,
            ban_duration_ms: DEFAULT_BAN_DURATION.as_millis() as u64,
            network_id: 1,
            max_per_request: fetcher.max_per_request,
            max_outstanding: fetcher.max_outstanding,
            fetch_attempts: fetcher.attempts,
        }
    }
}

impl NodeConfig {
    /// Load from a JSON file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&data)?;
        config.validate()?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_peers == 0 {
            return Err(ConfigError::Invalid("max_peers must be at least 1".into()));
        }
        if self.interval_ms == 0 || self.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "interval and timeout must be positive".into(),
            ));
        }
        if self.max_per_request == 0 || self.max_outstanding == 0 || self.fetch_attempts == 0 {
            return Err(ConfigError::Invalid("fetch limits must be positive".into()));
        }
        if self.max_per_request > MAX_HEADERS_PER_REQUEST {
            return Err(ConfigError::Invalid(format!(
                "max_per_request must not exceed {}",
                MAX_HEADERS_PER_REQUEST
            )));
        }
        self.seed_nodes()?;
        Ok(())
    }

    pub fn seed_nodes(&self) -> Result<Vec<SeedNode>, ConfigError> {
        self.bootnodes
            .iter()
            .map(|s| SeedNode::parse(s).ok_or_else(|| ConfigError::InvalidBootnode(s.clone())))
            .collect()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn ban_duration(&self) -> Duration {
        Duration::from_millis(self.ban_duration_ms)
    }

    pub fn server_config(&self) -> Result<ServerConfig, ConfigError> {
        Ok(ServerConfig {
            port: self.port,
            bootnodes: self.seed_nodes()?,
            ban_duration: self.ban_duration(),
            ..ServerConfig::default()
        })
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            min_peers: self.min_peers,
            interval: self.interval(),
            fetcher: FetcherConfig {
                max_per_request: self.max_per_request,
                max_outstanding: self.max_outstanding,
                attempts: self.fetch_attempts,
                interval: self.interval(),
            },
        }
    }
}
