//! Following a peer replica
//!
//! A follower tails one peer's binlog from its saved cursor and applies the
//! entries to the local engine under last-writer-wins. Applied entries are
//! not appended to the follower's own binlog.

use crate::binlog::{LogEntry, LogPosition};
use crate::common::{
    is_reserved_key, timestamp_now_nanos, Error, FollowConfig, LocalStore, Result, METRICS,
};
use crate::store::bootstrap::copy_from;
use crate::store::codec::{merge_values, StoredValue};
use crate::store::peer::{PeerConnector, PeerSource, TailRequest, TailResponse};
use crate::store::shard::Shard;
use crate::topology::ClusterShard;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What applying one entry did to the local engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Written,
    Deleted,
    Merged,
    /// Local value is newer
    Ignored,
    /// Checksum mismatch, or a merge operand the operator refuses
    Corrupt,
}

/// True when a write stamped `updated_at_ns` replaces what `store` holds.
///
/// Absent, expired or unreadable local values always lose. Ties go to the
/// incoming write.
pub(crate) fn incoming_wins(
    store: &dyn LocalStore,
    key: &[u8],
    updated_at_ns: u64,
    now_ns: u64,
) -> Result<bool> {
    let Some(bytes) = store.get(key)? else {
        return Ok(true);
    };
    match StoredValue::from_bytes(&bytes) {
        Ok(local) => Ok(local.is_expired(now_ns) || local.updated_at_ns <= updated_at_ns),
        Err(e) => {
            warn!("overwriting unreadable value of {}: {}", String::from_utf8_lossy(key), e);
            Ok(true)
        }
    }
}

/// Apply one replicated entry to `store`
pub fn apply_entry(store: &dyn LocalStore, entry: &LogEntry, now_ns: u64) -> Result<Applied> {
    if !entry.is_valid() {
        return Ok(Applied::Corrupt);
    }
    if is_reserved_key(&entry.key) {
        return Ok(Applied::Ignored);
    }

    if entry.is_merge() {
        let mut operand = StoredValue::new(
            entry.partition_hash,
            entry.updated_at_ns,
            0,
            entry.value.clone(),
        );
        operand.data_type = entry.merge_type();
        let operand = operand.to_bytes();
        let existing = store.get(&entry.key)?;
        if let Err(e) = merge_values(existing.as_deref(), &[operand.as_slice()], now_ns) {
            debug!("merge into {} refused: {}", String::from_utf8_lossy(&entry.key), e);
            return Ok(Applied::Corrupt);
        }
        store.merge(&entry.key, operand)?;
        return Ok(Applied::Merged);
    }

    if !incoming_wins(store, &entry.key, entry.updated_at_ns, now_ns)? {
        return Ok(Applied::Ignored);
    }
    if entry.is_delete {
        store.delete(&entry.key)?;
        Ok(Applied::Deleted)
    } else {
        let value = StoredValue::new(
            entry.partition_hash,
            entry.updated_at_ns,
            entry.ttl_second,
            entry.value.clone(),
        );
        store.put(&entry.key, value.to_bytes())?;
        Ok(Applied::Written)
    }
}

/// Apply one bootstrap row, already in stored-value form
pub fn apply_row(store: &dyn LocalStore, key: &[u8], value: &[u8], now_ns: u64) -> Result<bool> {
    if is_reserved_key(key) {
        return Ok(false);
    }
    let incoming = StoredValue::from_bytes(value)?;
    if incoming.is_expired(now_ns) || !incoming_wins(store, key, incoming.updated_at_ns, now_ns)? {
        return Ok(false);
    }
    store.put(key, value.to_vec())?;
    Ok(true)
}

/// One follow relationship
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowSpec {
    pub source: PeerSource,
    /// Ring size the source owns its keys under
    pub source_cluster_size: u32,
    /// Ring size the follower owns its keys under
    pub target_cluster_size: u32,
}

impl FollowSpec {
    pub fn new(source: PeerSource, source_cluster_size: u32, target_cluster_size: u32) -> Self {
        Self {
            source,
            source_cluster_size,
            target_cluster_size,
        }
    }
}

pub(crate) fn follow_name(shard: &Shard, source: &ClusterShard) -> String {
    format!("{} <- {}", shard, source)
}

enum TailOutcome {
    Cancelled,
    OutOfSync,
}

pub struct Follower {
    shard: Arc<Shard>,
    peers: Arc<dyn PeerConnector>,
    config: FollowConfig,
}

impl Follower {
    pub fn new(shard: Arc<Shard>, peers: Arc<dyn PeerConnector>, config: FollowConfig) -> Self {
        Self { shard, peers, config }
    }

    pub fn shard(&self) -> &Arc<Shard> {
        &self.shard
    }

    /// Metrics key of one follow relationship
    pub fn name(&self, spec: &FollowSpec) -> String {
        follow_name(&self.shard, &spec.source.shard)
    }

    /// Tail `spec.source` until cancelled.
    ///
    /// Returns an error when the stream breaks; the caller reconnects. A
    /// source that purged our cursor's segment is re-bootstrapped from and
    /// then tailed again.
    pub async fn follow(&self, spec: &FollowSpec, cancel: &CancellationToken) -> Result<()> {
        loop {
            match self.tail(spec, cancel).await? {
                TailOutcome::Cancelled => return Ok(()),
                TailOutcome::OutOfSync => {
                    METRICS.out_of_sync_restarts.inc();
                    warn!("{} fell out of sync, bootstrapping again", self.name(spec));
                    copy_from(
                        &self.shard,
                        self.peers.as_ref(),
                        &spec.source,
                        spec.source_cluster_size,
                        spec.target_cluster_size,
                    )
                    .await?;
                }
            }
        }
    }

    async fn tail(&self, spec: &FollowSpec, cancel: &CancellationToken) -> Result<TailOutcome> {
        let name = self.name(spec);
        let key = spec.source.cursor_key();
        let progress = self.shard.progress();
        let mut position = progress.load(&key)?.unwrap_or_default();
        let mut saved = position;

        let request = TailRequest {
            keyspace: self.shard.keyspace().to_string(),
            shard_id: spec.source.shard.shard_id,
            segment: position.segment,
            offset: position.offset,
            limit: self.config.batch_limit,
            target_cluster_size: Some(spec.target_cluster_size),
            target_shard_id: Some(self.shard.shard_id()),
            origin: self.shard.to_string(),
        };
        let mut stream = self.peers.tail(&spec.source.admin_address, request).await?;
        info!("{} tailing {} from {}", name, spec.source.admin_address, position);

        let mut flush = tokio::time::interval(self.config.cursor_flush_interval());
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut unflushed = 0u64;

        let outcome = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break Ok(TailOutcome::Cancelled),
                _ = flush.tick() => {
                    if position != saved {
                        if let Err(e) = progress.save(&key, position) {
                            break Err(e);
                        }
                        saved = position;
                        unflushed = 0;
                    }
                    continue;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(TailResponse::Batch {
                    entries,
                    next_segment,
                    next_offset,
                })) => {
                    let started = Instant::now();
                    let (applied, ignored) = match self.apply_batch(&entries) {
                        Ok(counts) => counts,
                        Err(e) => break Err(e),
                    };
                    position = LogPosition::new(next_segment, next_offset);
                    unflushed += entries.len() as u64;
                    METRICS.record_follow_batch(
                        &name,
                        applied,
                        ignored,
                        started.elapsed(),
                        next_segment,
                        next_offset,
                    );

                    if unflushed >= self.config.cursor_flush_entries {
                        if let Err(e) = progress.save(&key, position) {
                            break Err(e);
                        }
                        saved = position;
                        unflushed = 0;
                    }
                }
                Some(Ok(TailResponse::OutOfSync)) => break Ok(TailOutcome::OutOfSync),
                Some(Err(e)) => break Err(e),
                None => {
                    break Err(Error::ConnectionFailed(format!(
                        "{} closed the tail stream",
                        spec.source
                    )))
                }
            }
        };

        if position != saved {
            match progress.save(&key, position) {
                Ok(()) => debug!("{} stopped at {}", name, position),
                Err(e) => warn!("{} failed to save cursor {}: {}", name, position, e),
            }
        }
        outcome
    }

    fn apply_batch(&self, entries: &[LogEntry]) -> Result<(u64, u64)> {
        let _write = self.shard.write_guard();
        let now = timestamp_now_nanos();
        let store = self.shard.store().as_ref();
        let mut applied = 0u64;
        let mut ignored = 0u64;
        for entry in entries {
            match apply_entry(store, entry, now)? {
                Applied::Ignored => ignored += 1,
                Applied::Corrupt => {
                    METRICS.corrupt_entries_skipped.inc();
                    warn!(
                        "{}: skipping corrupt entry for {}",
                        self.shard,
                        String::from_utf8_lossy(&entry.key)
                    );
                    ignored += 1;
                }
                Applied::Merged => {
                    METRICS.entries_merged.inc();
                    applied += 1;
                }
                Applied::Written | Applied::Deleted => applied += 1,
            }
        }
        Ok((applied, ignored))
    }
}
