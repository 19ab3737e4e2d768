//! Executing a bootstrap plan
//!
//! Copies peer snapshots into a shard before it starts following. Each copy
//! ends with the source's log position at snapshot time, saved as the
//! follow cursor for that source.

use crate::common::{timestamp_now_nanos, Error, Result, METRICS};
use crate::store::follow::apply_row;
use crate::store::peer::{BootstrapCopyRequest, PeerConnector, PeerSource};
use crate::store::shard::{Shard, BOOTSTRAP_COPY_BATCH_SIZE};
use crate::topology::{BootstrapPlan, ClusterRing};
use futures_util::future::try_join_all;
use futures_util::StreamExt;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Copy `source`'s snapshot of the keys `shard` owns in a ring of
/// `target_cluster_size`. Returns the number of rows written.
pub async fn copy_from(
    shard: &Shard,
    peers: &dyn PeerConnector,
    source: &PeerSource,
    source_cluster_size: u32,
    target_cluster_size: u32,
) -> Result<u64> {
    let started = Instant::now();
    let request = BootstrapCopyRequest {
        keyspace: shard.keyspace().to_string(),
        shard_id: source.shard.shard_id,
        cluster_size: source_cluster_size,
        target_cluster_size: Some(target_cluster_size),
        target_shard_id: Some(shard.shard_id()),
        batch_size: BOOTSTRAP_COPY_BATCH_SIZE,
        origin: shard.to_string(),
    };
    let mut stream = peers.bootstrap_copy(&source.admin_address, request).await?;

    let store = shard.store().as_ref();
    let mut received = 0u64;
    let mut written = 0u64;
    let mut cursor = None;
    while let Some(response) = stream.next().await {
        let response = response?;
        {
            let _write = shard.write_guard();
            let now = timestamp_now_nanos();
            for (key, value) in &response.key_values {
                received += 1;
                if apply_row(store, key, value, now)? {
                    written += 1;
                }
            }
        }
        if response.cursor.is_some() {
            cursor = response.cursor;
        }
    }

    let cursor = cursor.ok_or_else(|| {
        Error::ConnectionFailed(format!("{} ended the bootstrap copy early", source))
    })?;
    shard.progress().save(&source.cursor_key(), cursor)?;
    METRICS.bootstrap_rows_copied.add(written);
    info!(
        "{} copied {}/{} rows from {} in {:?}, cursor {}",
        shard,
        written,
        received,
        source,
        started.elapsed(),
        cursor
    );
    Ok(written)
}

/// Return whichever of `sources` has the most advanced binlog
async fn most_advanced(
    shard: &Shard,
    peers: &dyn PeerConnector,
    sources: &[PeerSource],
) -> Option<PeerSource> {
    let mut best = None;
    for source in sources {
        match peers
            .check_binlog(&source.admin_address, shard.keyspace(), source.shard.shard_id)
            .await
        {
            Ok(range) => {
                debug!("{} binlog of {}: {:?}", shard, source, range);
                let rank = (range.latest, range.latest_offset);
                if best.as_ref().map_or(true, |(r, _)| rank > *r) {
                    best = Some((rank, source.clone()));
                }
            }
            Err(e) => warn!("{} cannot reach {}: {}", shard, source, e),
        }
    }
    best.map(|(_, source)| source)
}

/// True when some source still holds the segment our cursor points into
async fn can_resume(shard: &Shard, peers: &dyn PeerConnector, sources: &[PeerSource]) -> bool {
    for source in sources {
        let cursor = match shard.progress().load(&source.cursor_key()) {
            Ok(Some(cursor)) => cursor,
            Ok(None) => continue,
            Err(e) => {
                warn!("{} unreadable cursor for {}: {}", shard, source, e);
                continue;
            }
        };
        match peers
            .check_binlog(&source.admin_address, shard.keyspace(), source.shard.shard_id)
            .await
        {
            Ok(range) if cursor.segment >= range.earliest => {
                debug!("{} resumes {} at {}", shard, source, cursor);
                return true;
            }
            Ok(range) => info!(
                "{} cursor {} for {} is behind earliest segment {}",
                shard, cursor, source, range.earliest
            ),
            Err(e) => warn!("{} cannot reach {}: {}", shard, source, e),
        }
    }
    false
}

/// Run the copy half of `plan` for `shard`.
///
/// Sources are resolved against the current ring of `ring`. With
/// `pick_best_source` only the most advanced reachable source is copied;
/// otherwise every source is drained concurrently.
pub async fn execute_plan(
    shard: &Shard,
    peers: &dyn PeerConnector,
    ring: &ClusterRing,
    plan: &BootstrapPlan,
) -> Result<()> {
    if plan.is_normal_start && !plan.normal_start_bootstrap_needed {
        debug!("{} normal start, no bootstrap needed", shard);
        return Ok(());
    }
    if plan.bootstrap_source.is_empty() {
        debug!("{} has nothing to bootstrap from", shard);
        return Ok(());
    }
    info!("{} bootstrap: {}", shard, plan);

    let mut sources = Vec::with_capacity(plan.bootstrap_source.len());
    for cs in &plan.bootstrap_source {
        match PeerSource::resolve(ring, *cs) {
            Ok(source) => sources.push(source),
            Err(e) if plan.pick_best_source => warn!("{} skips source {}: {}", shard, cs, e),
            Err(e) => return Err(e),
        }
    }

    if plan.pick_best_source {
        if plan.is_normal_start && can_resume(shard, peers, &sources).await {
            return Ok(());
        }
        let best = most_advanced(shard, peers, &sources).await.ok_or_else(|| {
            Error::ConnectionFailed(format!("{} found no reachable bootstrap source", shard))
        })?;
        copy_from(shard, peers, &best, plan.from_cluster_size, plan.to_cluster_size).await?;
    } else {
        try_join_all(sources.iter().map(|source| {
            copy_from(shard, peers, source, plan.from_cluster_size, plan.to_cluster_size)
        }))
        .await?;
    }

    METRICS.bootstraps_completed.inc();
    Ok(())
}
