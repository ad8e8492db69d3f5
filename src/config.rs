// Node configuration

use crate::core::validate_address;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Address of the node every other node bootstraps from
pub const DEFAULT_BOOTSTRAP_ADDR: &str = "localhost:3000";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node id, also the listening port
    pub node_id: String,
    /// Address this node listens on and announces to peers
    pub node_addr: String,
    /// Address of the bootstrap (central) node
    #[serde(default = "default_bootstrap_addr")]
    pub bootstrap_addr: String,
    /// Directory holding the ledger database and wallet file
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Reward address; mining is enabled when set
    #[serde(default)]
    pub miner_address: Option<String>,
    /// Pending transactions needed to start a mining job
    #[serde(default = "default_mine_tx_count")]
    pub mine_tx_count: usize,
    /// Connect and write timeout for outbound messages
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// How long a new node waits for the bootstrap snapshot
    #[serde(default = "default_bootstrap_timeout_ms")]
    pub bootstrap_timeout_ms: u64,
    /// Largest accepted inbound message
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_bootstrap_addr() -> String {
    DEFAULT_BOOTSTRAP_ADDR.to_owned()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("db")
}

const fn default_mine_tx_count() -> usize {
    1
}

const fn default_send_timeout_ms() -> u64 {
    5_000
}

const fn default_bootstrap_timeout_ms() -> u64 {
    3_000
}

const fn default_max_message_size() -> usize {
    64 * 1024 * 1024
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::for_node("3000")
    }
}

impl NodeConfig {
    /// Defaults for the node listening on `localhost:<node_id>`
    pub fn for_node(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_owned(),
            node_addr: format!("localhost:{}", node_id),
            bootstrap_addr: default_bootstrap_addr(),
            data_dir: default_data_dir(),
            miner_address: None,
            mine_tx_count: default_mine_tx_count(),
            send_timeout_ms: default_send_timeout_ms(),
            bootstrap_timeout_ms: default_bootstrap_timeout_ms(),
            max_message_size: default_max_message_size(),
        }
    }

    /// Build from `NODE_ID` (required), `BOOTSTRAP_ADDR`, `MINER_ADDRESS`
    /// and `DATA_DIR`
    pub fn from_env() -> Result<Self> {
        let node_id = std::env::var("NODE_ID")
            .map_err(|_| Error::Config("NODE_ID is not set".to_owned()))?;

        let mut config = Self::for_node(&node_id);
        if let Ok(addr) = std::env::var("BOOTSTRAP_ADDR") {
            config.bootstrap_addr = addr;
        }
        if let Ok(dir) = std::env::var("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        config.miner_address = std::env::var("MINER_ADDRESS").ok().filter(|a| !a.is_empty());

        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(Error::Config("node id is empty".to_owned()));
        }
        if self.mine_tx_count == 0 {
            return Err(Error::Config("mine_tx_count must be at least 1".to_owned()));
        }
        if let Some(address) = &self.miner_address {
            if !validate_address(address) {
                return Err(Error::Config(format!("invalid miner address {}", address)));
            }
        }
        Ok(())
    }

    pub fn is_bootstrap_node(&self) -> bool {
        self.node_addr == self.bootstrap_addr
    }

    pub fn is_miner(&self) -> bool {
        self.miner_address.is_some()
    }

    /// sled database directory for this node
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(format!("blockchain_{}", self.node_id))
    }

    pub fn wallet_path(&self) -> PathBuf {
        self.data_dir.join(format!("wallet_{}.json", self.node_id))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }
}
