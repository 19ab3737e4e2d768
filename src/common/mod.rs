//! Common utilities and types shared across ringkv

pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod storage;
pub mod utils;

pub use config::{FollowConfig, LogConfig, LogSyncPolicy, StoreConfig};
pub use error::{Error, Result};
pub use hash::{jump_hash, partition_hash, shard_for_key};
pub use metrics::METRICS;
pub use storage::{is_reserved_key, KeyValue, LocalStore, MemStore, ShardFilter, RESERVED_PREFIX};
pub use utils::{crc32, crc32_parts, format_bytes, retry_forever, timestamp_now_nanos};
