//! Process configuration
//!
//! One flat struct loaded at startup (JSON file or defaults) and handed to
//! each subsystem. Shards snapshot the fields they consult on hot paths, so
//! mutating the config after startup only affects newly created shards.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of shards; each shard owns a single-threaded worker
    pub shard_count: u32,

    /// Max field/value length for the hash listpack encoding
    pub hash_max_listpack_value_len: usize,

    /// Max total bytes for the hash listpack encoding
    pub hash_max_listpack_bytes: usize,

    /// Max element count for the sorted-set listpack encoding
    pub zset_max_listpack_entries: usize,

    /// Max member length for the sorted-set listpack encoding
    pub zset_max_listpack_value_len: usize,

    /// Max bytes a single replication stream may keep in flight before
    /// `is_stalled` trips
    pub replication_stream_output_limit: usize,

    /// How long a stalled streamer waits for drain progress (milliseconds)
    pub replication_stream_timeout_ms: u64,

    /// Tiered storage knobs; `None` disables tiering
    pub tiering: Option<TieringConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shard_count: 1,
            hash_max_listpack_value_len: 64,
            hash_max_listpack_bytes: 1024,
            zset_max_listpack_entries: 128,
            zset_max_listpack_value_len: 64,
            replication_stream_output_limit: 64 * 1024,
            replication_stream_timeout_ms: 500,
            tiering: None,
        }
    }
}

/// Tiered storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TieringConfig {
    /// File path prefix; the shard id is appended (`<prefix><shard-id>`)
    pub path_prefix: String,

    /// Smallest value size eligible for stashing
    pub min_value_size: usize,

    /// Max outstanding stash writes per shard
    pub write_depth: usize,

    /// Max file size in bytes per shard
    pub max_file_size: u64,

    /// Whether values fetched for read-only access may be uploaded back
    /// to memory
    pub experimental_upload_on_read: bool,
}

impl Default for TieringConfig {
    fn default() -> Self {
        Self {
            path_prefix: "shoal-tiered-".to_string(),
            min_value_size: 64,
            write_depth: 50,
            max_file_size: 1 << 30,
            experimental_upload_on_read: false,
        }
    }
}

impl Config {
    /// Load from a JSON file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.shard_count, 1);
        assert_eq!(config.replication_stream_output_limit, 64 * 1024);
        assert_eq!(config.replication_stream_timeout_ms, 500);
        assert!(config.tiering.is_none());
    }

    #[test]
    fn test_tiering_defaults() {
        let tiering = TieringConfig::default();
        assert_eq!(tiering.min_value_size, 64);
        assert_eq!(tiering.write_depth, 50);
    }
}
