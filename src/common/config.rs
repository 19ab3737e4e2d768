//! Configuration for ringkv store processes

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Store node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Server id of this store inside its cluster
    pub server_id: u32,

    /// Root directory for shard data and binlogs
    pub data_dir: PathBuf,

    /// Binlog settings
    #[serde(default)]
    pub log: LogConfig,

    /// Replication follower settings
    #[serde(default)]
    pub follow: FollowConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Binlog durability policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSyncPolicy {
    /// fsync after every append
    Always,
    /// flush every append, fsync on a timer
    Interval,
    /// flush every append, leave fsync to the OS
    Never,
}

impl Default for LogSyncPolicy {
    fn default() -> Self {
        LogSyncPolicy::Interval
    }
}

/// Binlog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Segment size in bytes before rolling to a new segment
    #[serde(default = "default_max_segment_size")]
    pub max_segment_size: u64,

    /// Number of sealed segments kept behind the active one
    #[serde(default = "default_retained_segments")]
    pub retained_segments: u32,

    #[serde(default)]
    pub sync: LogSyncPolicy,

    #[serde(default = "default_sync_interval")]
    pub sync_interval_ms: u64,
}

fn default_max_segment_size() -> u64 {
    64 * 1024 * 1024
}
fn default_retained_segments() -> u32 {
    3
}
fn default_sync_interval() -> u64 {
    1000
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_segment_size: default_max_segment_size(),
            retained_segments: default_retained_segments(),
            sync: LogSyncPolicy::default(),
            sync_interval_ms: default_sync_interval(),
        }
    }
}

/// Follower configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowConfig {
    /// Max entries per tail batch
    #[serde(default = "default_batch_limit")]
    pub batch_limit: u32,

    /// Base wait between reconnect attempts (jittered up to 2x)
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,

    /// Cursor is flushed at least this often while following
    #[serde(default = "default_cursor_flush_interval")]
    pub cursor_flush_interval_ms: u64,

    /// ...or after this many applied entries, whichever comes first
    #[serde(default = "default_cursor_flush_entries")]
    pub cursor_flush_entries: u64,
}

fn default_batch_limit() -> u32 {
    8096
}
fn default_retry_interval() -> u64 {
    2000
}
fn default_cursor_flush_interval() -> u64 {
    1000
}
fn default_cursor_flush_entries() -> u64 {
    1024
}

impl Default for FollowConfig {
    fn default() -> Self {
        Self {
            batch_limit: default_batch_limit(),
            retry_interval_ms: default_retry_interval(),
            cursor_flush_interval_ms: default_cursor_flush_interval(),
            cursor_flush_entries: default_cursor_flush_entries(),
        }
    }
}

impl FollowConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn cursor_flush_interval(&self) -> Duration {
        Duration::from_millis(self.cursor_flush_interval_ms)
    }
}

impl StoreConfig {
    /// Load from a TOML file, with `RINGKV_*` environment overrides
    /// (e.g. `RINGKV_LOG__RETAINED_SEGMENTS=5`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("RINGKV").separator("__"))
            .build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        let cfg: StoreConfig = settings
            .try_deserialize()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.log.max_segment_size == 0 {
            return Err(Error::InvalidConfig("log.max_segment_size must be > 0".into()));
        }
        if self.follow.batch_limit == 0 {
            return Err(Error::InvalidConfig("follow.batch_limit must be > 0".into()));
        }
        if self.follow.cursor_flush_entries == 0 {
            return Err(Error::InvalidConfig(
                "follow.cursor_flush_entries must be > 0".into(),
            ));
        }
        Ok(())
    }

    fn shard_dir(&self, keyspace: &str, shard_id: u32) -> PathBuf {
        self.data_dir
            .join(keyspace)
            .join(format!("{}_{}", self.server_id, shard_id))
    }

    /// Directory holding one shard's binlog segments
    pub fn shard_log_dir(&self, keyspace: &str, shard_id: u32) -> PathBuf {
        self.shard_dir(keyspace, shard_id).join("binlog")
    }

    /// Directory holding one shard's local engine files
    pub fn shard_data_dir(&self, keyspace: &str, shard_id: u32) -> PathBuf {
        self.shard_dir(keyspace, shard_id).join("db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "server_id = 3").unwrap();
        writeln!(f, "data_dir = \"/var/lib/ringkv\"").unwrap();
        writeln!(f, "[log]").unwrap();
        writeln!(f, "retained_segments = 7").unwrap();
        writeln!(f, "sync = \"always\"").unwrap();
        drop(f);

        let cfg = StoreConfig::load(&path).unwrap();
        assert_eq!(cfg.server_id, 3);
        assert_eq!(cfg.log.retained_segments, 7);
        assert_eq!(cfg.log.sync, LogSyncPolicy::Always);
        assert_eq!(cfg.log.max_segment_size, 64 * 1024 * 1024);
        assert_eq!(cfg.follow.batch_limit, 8096);
        assert_eq!(cfg.log_level, "info");
        assert_eq!(
            cfg.shard_log_dir("users", 1),
            PathBuf::from("/var/lib/ringkv/users/3_1/binlog")
        );
    }

    #[test]
    fn test_validate_rejects_zero_segment() {
        let cfg = StoreConfig {
            server_id: 0,
            data_dir: PathBuf::from("/tmp"),
            log: LogConfig {
                max_segment_size: 0,
                ..LogConfig::default()
            },
            follow: FollowConfig::default(),
            log_level: default_log_level(),
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }
}
