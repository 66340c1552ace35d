//! Node configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use torrentium_core::tcp::MAX_CHUNK_SIZE;
use torrentium_core::{Error, PeerAddress, Result, CHUNK_SIZE};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory path
    pub data_dir: String,

    /// Local node identity and listener
    pub node: NodeConfig,

    /// DHT configuration
    pub dht: DhtConfig,

    /// Transfer configuration
    pub transfer: TransferConfig,

    /// Peer health configuration
    pub health: HealthConfig,

    /// Text search configuration
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address the TCP listener binds to
    pub listen_address: String,
    /// Address other peers should dial, if different from the bound one
    pub advertise_address: Option<String>,
    /// Stable peer id; a random one is generated when unset
    pub peer_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Bootstrap nodes
    pub bootstrap_nodes: Vec<String>,
    /// K parameter (nodes per bucket)
    pub k: usize,
    /// Alpha parameter (lookup parallelism)
    pub alpha: usize,
    /// Seconds between maintenance cycles
    pub maintenance_interval_secs: u64,
    /// Random extra delay added to each cycle
    pub maintenance_jitter_secs: u64,
    /// Provider records older than this are discarded
    pub provider_ttl_secs: u64,
    pub query_timeout_secs: u64,
    pub bootstrap_max_attempts: u32,
    pub bootstrap_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Maximum concurrent chunk requests
    pub max_concurrent_requests: usize,
    /// Chunk request timeout in seconds
    pub request_timeout_secs: u64,
    /// Attempts per chunk against one provider before giving up on it
    pub chunk_attempts: u32,
    /// Must match across every node publishing the same content
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failures before a peer is marked unhealthy
    pub failure_threshold: u32,
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Per-peer timeout for text queries
    pub peer_timeout_secs: u64,
    pub max_results: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "~/.torrentium".to_string(),
            node: NodeConfig::default(),
            dht: DhtConfig::default(),
            transfer: TransferConfig::default(),
            health: HealthConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:7040".to_string(),
            advertise_address: None,
            peer_id: None,
        }
    }
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bootstrap_nodes: vec![],
            k: 20,
            alpha: 3,
            maintenance_interval_secs: 600,
            maintenance_jitter_secs: 30,
            provider_ttl_secs: 24 * 60 * 60,
            query_timeout_secs: 10,
            bootstrap_max_attempts: 5,
            bootstrap_backoff_ms: 500,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 16,
            request_timeout_secs: 30,
            chunk_attempts: 3,
            chunk_size: CHUNK_SIZE,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            probe_timeout_secs: 5,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            peer_timeout_secs: 5,
            max_results: 50,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::InvalidData(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the node cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.transfer.chunk_size == 0 {
            return Err(Error::InvalidData("transfer.chunk_size must be positive".into()));
        }
        if self.transfer.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidData(format!(
                "transfer.chunk_size must be at most {} bytes",
                MAX_CHUNK_SIZE
            )));
        }
        if self.transfer.max_concurrent_requests == 0 || self.transfer.chunk_attempts == 0 {
            return Err(Error::InvalidData(
                "transfer.max_concurrent_requests and transfer.chunk_attempts must be positive"
                    .into(),
            ));
        }
        if self.dht.k == 0 || self.dht.alpha == 0 {
            return Err(Error::InvalidData("dht.k and dht.alpha must be positive".into()));
        }
        let durations = [
            ("dht.maintenance_interval_secs", self.dht.maintenance_interval_secs),
            ("dht.provider_ttl_secs", self.dht.provider_ttl_secs),
            ("dht.query_timeout_secs", self.dht.query_timeout_secs),
            ("transfer.request_timeout_secs", self.transfer.request_timeout_secs),
            ("health.probe_timeout_secs", self.health.probe_timeout_secs),
            ("search.peer_timeout_secs", self.search.peer_timeout_secs),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, secs)| *secs == 0) {
            return Err(Error::InvalidData(format!("{} must be positive", name)));
        }
        for address in &self.dht.bootstrap_nodes {
            address.parse::<PeerAddress>()?;
        }
        Ok(())
    }

    /// Expand ~ in data_dir path
    pub fn data_dir(&self) -> PathBuf {
        expand_path(&self.data_dir)
    }

    /// SQLite metadata database
    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("torrentium.db")
    }

    /// Where completed downloads land
    pub fn download_dir(&self) -> PathBuf {
        self.data_dir().join("downloads")
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.dht.maintenance_interval_secs)
    }

    pub fn maintenance_jitter(&self) -> Duration {
        Duration::from_secs(self.dht.maintenance_jitter_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer.request_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.health.probe_timeout_secs)
    }

    pub fn search_peer_timeout(&self) -> Duration {
        Duration::from_secs(self.search.peer_timeout_secs)
    }

    /// Settings for the discovery service
    pub fn dht_config(&self) -> torrentium_dht::DhtConfig {
        torrentium_dht::DhtConfig {
            k: self.dht.k,
            alpha: self.dht.alpha,
            bootstrap_nodes: self
                .dht
                .bootstrap_nodes
                .iter()
                .map(|s| PeerAddress::new(s.trim()))
                .collect(),
            query_timeout: Duration::from_secs(self.dht.query_timeout_secs),
            provider_ttl: Duration::from_secs(self.dht.provider_ttl_secs),
            bootstrap_max_attempts: self.dht.bootstrap_max_attempts,
            bootstrap_backoff: Duration::from_millis(self.dht.bootstrap_backoff_ms),
            ..Default::default()
        }
    }
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
