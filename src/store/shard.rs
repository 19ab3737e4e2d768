//! One shard replica on this store
//!
//! Local mutations are appended to the shard's binlog before they reach the
//! local engine. The same binlog and engine back the serve side of the peer
//! calls: tailing, binlog range checks and bootstrap snapshots.

use crate::binlog::{LogEntry, LogManager, LogPosition, MergeType, SegmentRange};
use crate::common::{
    is_reserved_key, jump_hash, partition_hash, timestamp_now_nanos, Error, LocalStore, Result,
    StoreConfig,
};
use crate::store::codec::{merge_values, partition_hash_of, StoredValue};
use crate::store::follow::incoming_wins;
use crate::store::peer::{
    BootstrapCopyRequest, BootstrapCopyResponse, CopyStream, TailRequest, TailResponse, TailStream,
};
use crate::store::progress::ProgressStore;
use crate::topology::{ShardInfo, ShardStatus};
use futures_util::StreamExt;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Rows per bootstrap copy message unless the request asks otherwise
pub const BOOTSTRAP_COPY_BATCH_SIZE: usize = 1024;

pub struct Shard {
    keyspace: String,
    server_id: u32,
    shard_id: u32,
    cluster_size: AtomicU32,
    replication_factor: AtomicU32,
    status: RwLock<ShardStatus>,
    store: Arc<dyn LocalStore>,
    log: Arc<LogManager>,
    progress: ProgressStore,
    write_lock: Mutex<()>,
}

impl Shard {
    pub fn new(info: &ShardInfo, store: Arc<dyn LocalStore>, log: Arc<LogManager>) -> Self {
        Self {
            keyspace: info.keyspace.clone(),
            server_id: info.server_id,
            shard_id: info.shard_id,
            cluster_size: AtomicU32::new(info.cluster_size),
            replication_factor: AtomicU32::new(info.replication_factor),
            status: RwLock::new(info.status),
            progress: ProgressStore::new(store.clone()),
            store,
            log,
            write_lock: Mutex::new(()),
        }
    }

    /// Open the shard's binlog under the store's data directory
    pub fn open(config: &StoreConfig, info: &ShardInfo, store: Arc<dyn LocalStore>) -> Result<Self> {
        let dir = config.shard_log_dir(&info.keyspace, info.shard_id);
        let log = Arc::new(LogManager::open(dir, &config.log)?);
        info!("open shard {} in {}", info.identifier(), log.dir().display());
        Ok(Self::new(info, store, log))
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn server_id(&self) -> u32 {
        self.server_id
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn cluster_size(&self) -> u32 {
        self.cluster_size.load(Ordering::Acquire)
    }

    pub fn replication_factor(&self) -> u32 {
        self.replication_factor.load(Ordering::Acquire)
    }

    pub fn set_cluster_size(&self, cluster_size: u32, replication_factor: u32) {
        self.cluster_size.store(cluster_size, Ordering::Release);
        self.replication_factor
            .store(replication_factor, Ordering::Release);
    }

    pub fn status(&self) -> ShardStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: ShardStatus) {
        let mut current = self.status.write();
        if *current != status {
            info!("shard {} {} => {}", self, *current, status);
            *current = status;
        }
    }

    pub fn info(&self) -> ShardInfo {
        ShardInfo::new(
            self.keyspace.clone(),
            self.server_id,
            self.shard_id,
            self.cluster_size(),
            self.replication_factor(),
        )
        .with_status(self.status())
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    pub fn log(&self) -> &Arc<LogManager> {
        &self.log
    }

    pub fn progress(&self) -> &ProgressStore {
        &self.progress
    }

    fn check_key(key: &[u8]) -> Result<()> {
        if is_reserved_key(key) {
            return Err(Error::InvalidConfig(format!(
                "key {} uses the reserved prefix",
                String::from_utf8_lossy(key)
            )));
        }
        Ok(())
    }

    /// Serializes local writes with replicated ones. Held across append and
    /// apply, and while a snapshot position is taken.
    pub(crate) fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock()
    }

    pub fn put(&self, key: &[u8], value: Vec<u8>, ttl_second: u32) -> Result<LogPosition> {
        Self::check_key(key)?;
        let ph = partition_hash(key);
        let _write = self.write_guard();
        let now = timestamp_now_nanos();
        let at = self
            .log
            .append(&LogEntry::put(ph, now, ttl_second, key.to_vec(), value.clone()))?;
        if incoming_wins(self.store.as_ref(), key, now, now)? {
            self.store
                .put(key, StoredValue::new(ph, now, ttl_second, value).to_bytes())?;
        }
        Ok(at)
    }

    pub fn delete(&self, key: &[u8]) -> Result<LogPosition> {
        Self::check_key(key)?;
        let ph = partition_hash(key);
        let _write = self.write_guard();
        let now = timestamp_now_nanos();
        let at = self.log.append(&LogEntry::delete(ph, now, key.to_vec()))?;
        if incoming_wins(self.store.as_ref(), key, now, now)? {
            self.store.delete(key)?;
        }
        Ok(at)
    }

    /// Fold `operand` into `key`. An operand the merge operator rejects is
    /// refused before it reaches the binlog.
    pub fn merge(&self, key: &[u8], merge_type: MergeType, operand: Vec<u8>) -> Result<LogPosition> {
        Self::check_key(key)?;
        let ph = partition_hash(key);
        let _write = self.write_guard();
        let now = timestamp_now_nanos();

        let mut value = StoredValue::new(ph, now, 0, operand.clone());
        value.data_type = merge_type;
        let value = value.to_bytes();
        let existing = self.store.get(key)?;
        merge_values(existing.as_deref(), &[value.as_slice()], now)?;

        let at = self
            .log
            .append(&LogEntry::merge(ph, now, merge_type, key.to_vec(), operand))?;
        self.store.merge(key, value)?;
        Ok(at)
    }

    /// Live value of `key`; expired values read as absent
    pub fn get(&self, key: &[u8]) -> Result<Option<StoredValue>> {
        Self::check_key(key)?;
        match self.store.get(key)? {
            Some(bytes) => {
                let value = StoredValue::from_bytes(&bytes)?;
                if value.is_expired(timestamp_now_nanos()) {
                    Ok(None)
                } else {
                    Ok(Some(value))
                }
            }
            None => Ok(None),
        }
    }

    /// Up to `limit` live entries under `prefix`, strictly after `after`
    pub fn prefix_scan(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, StoredValue)>> {
        let now = timestamp_now_nanos();
        let mut rows = Vec::new();
        let mut cursor = after.map(|a| a.to_vec());
        while rows.len() < limit {
            let page = self
                .store
                .prefix_scan(prefix, cursor.as_deref(), limit - rows.len())?;
            let Some((last, _)) = page.last() else { break };
            cursor = Some(last.clone());
            for (key, bytes) in page {
                if is_reserved_key(&key) {
                    continue;
                }
                let value = StoredValue::from_bytes(&bytes)?;
                if !value.is_expired(now) {
                    rows.push((key, value));
                }
            }
        }
        Ok(rows)
    }

    pub fn check_binlog(&self) -> Result<SegmentRange> {
        if self.log.is_closed() {
            return Err(Error::Shutdown(format!("shard {}", self)));
        }
        Ok(self.log.segment_range())
    }

    /// Serve a tail request until the log shuts down or the reader goes away.
    ///
    /// A purged start segment yields a single `OutOfSync` message.
    pub fn tail_stream(&self, request: TailRequest) -> TailStream {
        let log = self.log.clone();
        let name = self.to_string();
        let filter = match (request.target_cluster_size, request.target_shard_id) {
            (Some(size), Some(id)) if size > 0 => Some((size, id)),
            _ => None,
        };
        let mut limit = request.limit.max(1) as usize;
        if let Some((size, id)) = filter {
            // most entries of a foreign shard get filtered out
            if id != request.shard_id {
                limit *= size as usize;
            }
        }

        async_stream::stream! {
            debug!("shard {} tails for {} from {}:{}", name, request.origin, request.segment, request.offset);
            let mut segment = request.segment;
            let mut offset = request.offset;
            loop {
                match log.tail(segment, offset, limit).await {
                    Ok(batch) => {
                        segment = batch.next.segment;
                        offset = batch.next.offset;
                        let entries = batch
                            .entries
                            .into_iter()
                            .filter(|e| match filter {
                                Some((size, id)) => jump_hash(e.partition_hash, size) == id,
                                None => true,
                            })
                            .collect();
                        yield Ok(TailResponse::Batch {
                            entries,
                            next_segment: segment,
                            next_offset: offset,
                        });
                    }
                    Err(Error::OutOfSync { segment, earliest, latest }) => {
                        warn!(
                            "shard {}: {} reads purged segment {}, log holds [{},{}]",
                            name, request.origin, segment, earliest, latest
                        );
                        yield Ok(TailResponse::OutOfSync);
                        break;
                    }
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
            debug!("shard {} tail for {} completed", name, request.origin);
        }
        .boxed()
    }

    /// Stream a snapshot of the keys this shard owns.
    ///
    /// The log position is taken before scanning, with no local write half
    /// applied, so tailing from the final cursor replays every write the
    /// snapshot might have missed.
    pub fn bootstrap_copy(&self, request: BootstrapCopyRequest) -> CopyStream {
        let store = self.store.clone();
        let position = {
            let _write = self.write_guard();
            self.log.position()
        };
        let shard_id = self.shard_id;
        let name = self.to_string();
        let target = match (request.target_cluster_size, request.target_shard_id) {
            (Some(size), Some(id)) if size > 0 => Some((size, id)),
            _ => None,
        };
        let mut batch_size = if request.batch_size == 0 {
            BOOTSTRAP_COPY_BATCH_SIZE
        } else {
            request.batch_size
        };
        if let Some((size, id)) = target {
            if id != shard_id {
                batch_size *= size as usize;
            }
        }

        async_stream::stream! {
            let mut after: Option<Vec<u8>> = None;
            let mut sent = 0u64;
            let mut skipped = 0u64;
            loop {
                let page = match store.full_scan(after.as_deref(), batch_size) {
                    Ok(page) => page,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                let done = page.len() < batch_size;
                if let Some((last, _)) = page.last() {
                    after = Some(last.clone());
                }

                let mut key_values = Vec::with_capacity(page.len());
                for (key, value) in page {
                    if is_reserved_key(&key) {
                        skipped += 1;
                        continue;
                    }
                    let Some(ph) = partition_hash_of(&value) else {
                        skipped += 1;
                        continue;
                    };
                    let owned = request.cluster_size == 0
                        || jump_hash(ph, request.cluster_size) == shard_id;
                    let wanted = match target {
                        Some((size, id)) => jump_hash(ph, size) == id,
                        None => true,
                    };
                    if owned && wanted {
                        key_values.push((key, value));
                    } else {
                        skipped += 1;
                    }
                }
                sent += key_values.len() as u64;
                if !key_values.is_empty() {
                    yield Ok(BootstrapCopyResponse { key_values, cursor: None });
                }
                if done {
                    break;
                }
            }

            info!(
                "shard {} bootstrap copy for {} sent {} entries at {}, skipped {}",
                name, request.origin, sent, position, skipped
            );
            yield Ok(BootstrapCopyResponse { key_values: Vec::new(), cursor: Some(position) });
        }
        .boxed()
    }

    /// Stop serving: wake tailers with `Shutdown` and close the engine
    pub fn shutdown(&self) {
        self.log.shutdown();
        self.store.close();
        info!("shard {} shut down", self);
    }
}

impl std::fmt::Display for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.keyspace, self.server_id, self.shard_id)
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.to_string())
            .field("cluster_size", &self.cluster_size())
            .field("status", &self.status())
            .finish()
    }
}
