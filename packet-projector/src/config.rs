//! Configuration for the projector

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Projector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for the entity store
    pub data_dir: PathBuf,

    /// Default size of the open-packet listing
    pub list_limit: usize,

    /// Events held per packet while waiting for a missing predecessor
    pub max_pending_per_packet: usize,

    /// Control mailbox capacity of the pipeline task
    pub mailbox_capacity: usize,

    /// Page size when replaying the ledger log
    pub catch_up_page: usize,

    /// Processed events allowed above the cursor before a resync
    pub max_gap: usize,

    /// How often the pipeline checks for a gap that stopped closing
    pub gap_check_interval_ms: u64,

    /// Sync the WAL on every entity commit
    pub sync_writes: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/projector"),
            list_limit: 10,
            max_pending_per_packet: 1024,
            mailbox_capacity: 1000,
            catch_up_page: 512,
            max_gap: 4096,
            gap_check_interval_ms: 1000,
            sync_writes: false,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("PACKET_PROJECTOR_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(limit) = std::env::var("PACKET_PROJECTOR_LIST_LIMIT") {
            config.list_limit = limit.parse().map_err(|e| {
                crate::Error::Config(format!("PACKET_PROJECTOR_LIST_LIMIT: {}", e))
            })?;
        }

        Ok(config)
    }
}
