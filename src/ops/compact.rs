//! Dropping keys a shard no longer owns

use crate::common::{Result, ShardFilter};
use crate::store::Shard;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactReport {
    pub shard_id: u32,
    pub cluster_size: u32,
    pub keys_before: u64,
    pub keys_after: u64,
}

impl CompactReport {
    pub fn dropped(&self) -> u64 {
        self.keys_before - self.keys_after
    }
}

fn count_keys(shard: &Shard) -> Result<u64> {
    let store = shard.store();
    let mut count = 0u64;
    let mut after: Option<Vec<u8>> = None;
    loop {
        let page = store.full_scan(after.as_deref(), 1024)?;
        let Some((last, _)) = page.last() else { break };
        after = Some(last.clone());
        count += page.len() as u64;
    }
    Ok(count)
}

/// Install the sharding filter for a ring of `cluster_size` and compact
pub fn compact_shard(shard: &Shard, cluster_size: u32) -> Result<CompactReport> {
    let started = Instant::now();
    let keys_before = count_keys(shard)?;
    shard.store().set_compaction_filter(Some(ShardFilter {
        shard_id: shard.shard_id(),
        cluster_size,
    }));
    shard.store().compact()?;
    let keys_after = count_keys(shard)?;

    let report = CompactReport {
        shard_id: shard.shard_id(),
        cluster_size,
        keys_before,
        keys_after,
    };
    tracing::info!(
        "compacted {} for cluster size {}: dropped {} of {} keys in {:?}",
        shard,
        cluster_size,
        report.dropped(),
        keys_before,
        started.elapsed()
    );
    Ok(report)
}
