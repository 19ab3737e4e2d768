//! Local key-value engine abstraction
//!
//! The replication core only needs point operations, an associative merge,
//! ordered scans and a compaction hook that drops keys belonging to other
//! shards. `MemStore` is the default backend; `RocksStore` is available with
//! the `rocksdb` feature.

use crate::common::{jump_hash, timestamp_now_nanos, Error, Result};
use crate::store::codec::{merge_values, StoredValue};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "rocksdb")]
use std::sync::atomic::AtomicU64;
#[cfg(feature = "rocksdb")]
use std::sync::Arc;

/// Keys under this prefix hold node-local metadata (follow cursors) and are
/// never replicated, copied or filtered out by compaction.
pub const RESERVED_PREFIX: &[u8] = b"_ringkv.";

pub fn is_reserved_key(key: &[u8]) -> bool {
    key.starts_with(RESERVED_PREFIX)
}

pub type KeyValue = (Vec<u8>, Vec<u8>);

/// Which shard a store holds; compaction drops every other key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardFilter {
    pub shard_id: u32,
    pub cluster_size: u32,
}

impl ShardFilter {
    /// Should this stored entry survive compaction?
    pub fn keep(&self, key: &[u8], value: &[u8], now_ns: u64) -> bool {
        if is_reserved_key(key) {
            return true;
        }
        match StoredValue::from_bytes(value) {
            Ok(v) => {
                !v.is_expired(now_ns)
                    && jump_hash(v.partition_hash, self.cluster_size) == self.shard_id
            }
            // unknown layout, leave it for an operator to look at
            Err(_) => true,
        }
    }
}

/// Trait for local key-value storage backends
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Fold `operand` into the stored value with the shared merge operator
    fn merge(&self, key: &[u8], operand: Vec<u8>) -> Result<()>;

    /// Up to `limit` pairs whose key starts with `prefix`, strictly after `after`
    fn prefix_scan(&self, prefix: &[u8], after: Option<&[u8]>, limit: usize)
        -> Result<Vec<KeyValue>>;

    /// Up to `limit` pairs in key order, strictly after `after`
    fn full_scan(&self, after: Option<&[u8]>, limit: usize) -> Result<Vec<KeyValue>>;

    /// Run a full compaction, applying the shard filter if one is set
    fn compact(&self) -> Result<()>;

    fn set_compaction_filter(&self, filter: Option<ShardFilter>);

    /// Refuse further operations
    fn close(&self);
}

/// In-memory store (default)
#[derive(Default)]
pub struct MemStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    filter: Mutex<Option<ShardFilter>>,
    closed: AtomicBool,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Shutdown("local store closed".into()));
        }
        Ok(())
    }

    fn scan_after(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<KeyValue>> {
        self.check_open()?;
        let map = self.map.read();
        let lower = match after {
            Some(k) if k >= prefix => Bound::Excluded(k.to_vec()),
            _ => Bound::Included(prefix.to_vec()),
        };
        Ok(map
            .range((lower, Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

impl LocalStore for MemStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.check_open()?;
        self.map.write().insert(key.to_vec(), value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_open()?;
        self.map.write().remove(key);
        Ok(())
    }

    fn merge(&self, key: &[u8], operand: Vec<u8>) -> Result<()> {
        self.check_open()?;
        let mut map = self.map.write();
        let merged = merge_values(
            map.get(key).map(|v| v.as_slice()),
            &[operand.as_slice()],
            timestamp_now_nanos(),
        )?;
        map.insert(key.to_vec(), merged);
        Ok(())
    }

    fn prefix_scan(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<KeyValue>> {
        self.scan_after(prefix, after, limit)
    }

    fn full_scan(&self, after: Option<&[u8]>, limit: usize) -> Result<Vec<KeyValue>> {
        self.scan_after(&[], after, limit)
    }

    fn compact(&self) -> Result<()> {
        self.check_open()?;
        let Some(filter) = *self.filter.lock() else {
            return Ok(());
        };
        let now = timestamp_now_nanos();
        let mut map = self.map.write();
        let before = map.len();
        map.retain(|k, v| filter.keep(k, v, now));
        tracing::debug!(
            "compacted store for shard {}/{}: dropped {} keys",
            filter.shard_id,
            filter.cluster_size,
            before - map.len()
        );
        Ok(())
    }

    fn set_compaction_filter(&self, filter: Option<ShardFilter>) {
        *self.filter.lock() = filter;
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// RocksDB store
#[cfg(feature = "rocksdb")]
pub struct RocksStore {
    db: rocksdb::DB,
    /// `shard_id << 32 | cluster_size`, zero when no filter is set
    filter: Arc<AtomicU64>,
    closed: AtomicBool,
}

#[cfg(feature = "rocksdb")]
fn rocks_err(e: rocksdb::Error) -> Error {
    Error::Internal(format!("rocksdb: {}", e))
}

#[cfg(feature = "rocksdb")]
fn decode_filter(packed: u64) -> Option<ShardFilter> {
    let cluster_size = packed as u32;
    if cluster_size == 0 {
        return None;
    }
    Some(ShardFilter {
        shard_id: (packed >> 32) as u32,
        cluster_size,
    })
}

#[cfg(feature = "rocksdb")]
fn rocks_merge(
    _key: &[u8],
    existing: Option<&[u8]>,
    operands: &rocksdb::MergeOperands,
) -> Option<Vec<u8>> {
    let operands: Vec<&[u8]> = operands.iter().collect();
    match merge_values(existing, &operands, timestamp_now_nanos()) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("merge failed: {}", e);
            existing.map(|v| v.to_vec())
        }
    }
}

#[cfg(feature = "rocksdb")]
impl RocksStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let filter = Arc::new(AtomicU64::new(0));
        let filter_for_compaction = Arc::clone(&filter);

        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        opts.set_merge_operator_associative("ringkv.merge", rocks_merge);
        opts.set_compaction_filter("ringkv.sharding", move |_level: u32, key: &[u8], value: &[u8]| {
            match decode_filter(filter_for_compaction.load(Ordering::Relaxed)) {
                Some(f) if !f.keep(key, value, timestamp_now_nanos()) => {
                    rocksdb::compaction_filter::Decision::Remove
                }
                _ => rocksdb::compaction_filter::Decision::Keep,
            }
        });

        let db = rocksdb::DB::open(&opts, path.as_ref()).map_err(rocks_err)?;
        Ok(Self {
            db,
            filter,
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Shutdown("local store closed".into()));
        }
        Ok(())
    }

    fn scan_after(&self, prefix: &[u8], after: Option<&[u8]>, limit: usize) -> Result<Vec<KeyValue>> {
        self.check_open()?;
        let start: &[u8] = match after {
            Some(k) if k >= prefix => k,
            _ => prefix,
        };
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator(rocksdb::IteratorMode::From(start, rocksdb::Direction::Forward));
        for item in iter {
            let (k, v) = item.map_err(rocks_err)?;
            if !k.starts_with(prefix) || out.len() >= limit {
                break;
            }
            if after == Some(&k[..]) {
                continue;
            }
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }
}

#[cfg(feature = "rocksdb")]
impl LocalStore for RocksStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        self.db.get(key).map_err(rocks_err)
    }

    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.check_open()?;
        self.db.put(key, value).map_err(rocks_err)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_open()?;
        self.db.delete(key).map_err(rocks_err)
    }

    fn merge(&self, key: &[u8], operand: Vec<u8>) -> Result<()> {
        self.check_open()?;
        self.db.merge(key, operand).map_err(rocks_err)
    }

    fn prefix_scan(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<KeyValue>> {
        self.scan_after(prefix, after, limit)
    }

    fn full_scan(&self, after: Option<&[u8]>, limit: usize) -> Result<Vec<KeyValue>> {
        self.scan_after(&[], after, limit)
    }

    fn compact(&self) -> Result<()> {
        self.check_open()?;
        self.db.compact_range(None::<&[u8]>, None::<&[u8]>);
        Ok(())
    }

    fn set_compaction_filter(&self, filter: Option<ShardFilter>) {
        let packed = filter
            .map(|f| (f.shard_id as u64) << 32 | f.cluster_size as u64)
            .unwrap_or(0);
        self.filter.store(packed, Ordering::Relaxed);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
