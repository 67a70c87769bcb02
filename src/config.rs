//! Configuration for the offline write path

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("till-sync")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the durable stores
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Days a synced ledger entry is retained before it may be purged
    #[serde(default = "default_retention_days")]
    pub ledger_retention_days: i64,

    /// Background sync interval in seconds
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// Change-feed buffer capacity; a listener that falls further behind
    /// than this is treated as having missed events
    #[serde(default = "default_feed_capacity")]
    pub feed_capacity: usize,
}

fn default_retention_days() -> i64 {
    30
}

fn default_sync_interval() -> u64 {
    60
}

fn default_feed_capacity() -> usize {
    1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            ledger_retention_days: default_retention_days(),
            sync_interval_secs: default_sync_interval(),
            feed_capacity: default_feed_capacity(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get ledger database path
    pub fn ledger_db_path(&self) -> PathBuf {
        self.data_dir.join("ledger.sled")
    }

    /// Get pending-mutation queue database path
    pub fn queue_db_path(&self) -> PathBuf {
        self.data_dir.join("queue.sled")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn roundtrip_through_toml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");

        let config = Config {
            data_dir: temp.path().join("data"),
            ledger_retention_days: 14,
            sync_interval_secs: 10,
            feed_capacity: 64,
        };
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.ledger_retention_days, 14);
        assert_eq!(loaded.sync_interval_secs, 10);
        assert_eq!(loaded.ledger_db_path(), temp.path().join("data/ledger.sled"));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: Config = toml::from_str("ledger_retention_days = 7").unwrap();
        assert_eq!(config.ledger_retention_days, 7);
        assert_eq!(config.sync_interval_secs, default_sync_interval());
        assert_eq!(config.feed_capacity, default_feed_capacity());
    }
}
