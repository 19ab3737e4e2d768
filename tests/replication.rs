//! Replication tests: followers, bootstrap copies and out-of-sync recovery
//! between in-process shards

use ringkv::binlog::{LogEntry, LogManager, LogPosition, MergeType};
use ringkv::common::{
    jump_hash, partition_hash, timestamp_now_nanos, FollowConfig, LocalStore, LogConfig,
    LogSyncPolicy, MemStore, METRICS,
};
use ringkv::store::{
    apply_entry, execute_plan, Applied, CursorKey, FollowSpec, Follower, LocalPeers, PeerSource,
    Shard, StoredValue,
};
use ringkv::topology::{
    plan_with_topo_change, BootstrapRequest, ClusterRing, ClusterShard, ShardInfo, StoreResource,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn open_shard(dir: &TempDir, info: &ShardInfo, config: &LogConfig) -> Arc<Shard> {
    let path = dir
        .path()
        .join(format!("{}_{}", info.server_id, info.shard_id));
    let log = Arc::new(LogManager::open(path, config).unwrap());
    Arc::new(Shard::new(info, Arc::new(MemStore::new()), log))
}

fn fast_follow() -> FollowConfig {
    FollowConfig {
        batch_limit: 64,
        retry_interval_ms: 20,
        cursor_flush_interval_ms: 20,
        cursor_flush_entries: 16,
    }
}

/// Keys a ring of `size` assigns to `shard`
fn keys_for(shard: u32, size: u32, count: usize) -> Vec<Vec<u8>> {
    (0u64..)
        .map(|i| format!("user:{}", i).into_bytes())
        .filter(|k| jump_hash(partition_hash(k), size) == shard)
        .take(count)
        .collect()
}

async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

#[test]
fn test_last_writer_wins() {
    let store = MemStore::new();
    let ph = partition_hash(b"k");
    store
        .put(b"k", StoredValue::new(ph, 100, 0, b"local".to_vec()).to_bytes())
        .unwrap();

    let older = LogEntry::put(ph, 50, 0, b"k".to_vec(), b"older".to_vec());
    assert_eq!(apply_entry(&store, &older, 1_000).unwrap(), Applied::Ignored);
    let kept = StoredValue::from_bytes(&store.get(b"k").unwrap().unwrap()).unwrap();
    assert_eq!(kept.value, b"local".to_vec());

    let newer = LogEntry::put(ph, 150, 0, b"k".to_vec(), b"newer".to_vec());
    assert_eq!(apply_entry(&store, &newer, 1_000).unwrap(), Applied::Written);
    let kept = StoredValue::from_bytes(&store.get(b"k").unwrap().unwrap()).unwrap();
    assert_eq!(kept.value, b"newer".to_vec());
    assert_eq!(kept.updated_at_ns, 150);
}

#[tokio::test]
async fn test_follower_tails_and_saves_cursor() {
    let dir = TempDir::new().unwrap();
    let peers = Arc::new(LocalPeers::new());
    let source = open_shard(&dir, &ShardInfo::new("users", 0, 0, 1, 1), &LogConfig::default());
    let replica = open_shard(&dir, &ShardInfo::new("users", 1, 0, 1, 1), &LogConfig::default());
    peers.register("a:9001", source.clone());

    source.put(b"k1", b"one".to_vec(), 0).unwrap();
    source.put(b"k2", b"two".to_vec(), 0).unwrap();
    source.delete(b"k1").unwrap();

    let follower = Follower::new(replica.clone(), peers.clone(), fast_follow());
    let spec = FollowSpec::new(PeerSource::new(ClusterShard::new(0, 0), "a:9001"), 1, 1);
    let cancel = CancellationToken::new();
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { follower.follow(&spec, &cancel).await })
    };

    wait_until("k2", || replica.get(b"k2").unwrap().is_some()).await;
    source.put(b"k3", b"three".to_vec(), 0).unwrap();
    wait_until("k3", || replica.get(b"k3").unwrap().is_some()).await;
    assert!(replica.get(b"k1").unwrap().is_none());

    cancel.cancel();
    task.await.unwrap().unwrap();

    let cursor = replica
        .progress()
        .load(&CursorKey::new("a:9001", 0))
        .unwrap();
    assert_eq!(cursor, Some(source.log().position()));
    // followers do not re-log what they apply
    assert_eq!(replica.log().position(), LogPosition::new(0, 0));
}

#[tokio::test]
async fn test_out_of_sync_follower_bootstraps_again() {
    let dir = TempDir::new().unwrap();
    let small = LogConfig {
        max_segment_size: 256,
        retained_segments: 1,
        sync: LogSyncPolicy::Never,
        sync_interval_ms: 1000,
    };
    let peers = Arc::new(LocalPeers::new());
    let source = open_shard(&dir, &ShardInfo::new("users", 0, 0, 1, 1), &small);
    let replica = open_shard(&dir, &ShardInfo::new("users", 1, 0, 1, 1), &LogConfig::default());
    peers.register("a:9001", source.clone());

    for i in 0..20 {
        source
            .put(format!("k{}", i).as_bytes(), vec![b'x'; 100], 0)
            .unwrap();
    }
    assert!(source.check_binlog().unwrap().earliest > 0);
    let restarts = METRICS.out_of_sync_restarts.get();

    let follower = Follower::new(replica.clone(), peers.clone(), fast_follow());
    let spec = FollowSpec::new(PeerSource::new(ClusterShard::new(0, 0), "a:9001"), 1, 1);
    let cancel = CancellationToken::new();
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { follower.follow(&spec, &cancel).await })
    };

    wait_until("snapshot", || {
        (0..20).all(|i| replica.get(format!("k{}", i).as_bytes()).unwrap().is_some())
    })
    .await;
    assert!(METRICS.out_of_sync_restarts.get() > restarts);

    source.put(b"after", b"snapshot".to_vec(), 0).unwrap();
    wait_until("tail after snapshot", || replica.get(b"after").unwrap().is_some()).await;

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_new_shard_bootstraps_its_key_range() {
    let dir = TempDir::new().unwrap();
    let peers = Arc::new(LocalPeers::new());
    let old_store = StoreResource::new("a:9000", "a:9001");

    // ring of one, growing to two
    let ring = ClusterRing::new("users", "dc1", 1, 1).unwrap();
    let old_info = ShardInfo::new("users", 0, 0, 1, 1);
    ring.set_shard(&old_store, old_info.clone()).unwrap();
    let old = open_shard(&dir, &old_info, &LogConfig::default());
    peers.register(&old_store.admin_address, old.clone());

    let moving = keys_for(1, 2, 10);
    let staying = keys_for(0, 2, 10);
    for key in moving.iter().chain(&staying) {
        old.put(key, b"v".to_vec(), 0).unwrap();
    }

    let new_info = ShardInfo::new("users", 1, 1, 2, 1).candidate();
    let new = open_shard(&dir, &new_info, &LogConfig::default());
    let plan = plan_with_topo_change(&BootstrapRequest {
        server_id: 1,
        shard_id: 1,
        from_cluster_size: 1,
        to_cluster_size: 2,
        replication_factor: 1,
    });
    assert_eq!(plan.bootstrap_source, vec![ClusterShard::primary(0)]);

    execute_plan(&new, peers.as_ref(), &ring, &plan).await.unwrap();

    for key in &moving {
        assert!(new.get(key).unwrap().is_some());
    }
    for key in &staying {
        assert!(new.get(key).unwrap().is_none());
    }
    let cursor = new.progress().load(&CursorKey::new("a:9001", 0)).unwrap();
    assert_eq!(cursor, Some(old.log().position()));
}

#[tokio::test]
async fn test_unreachable_source_is_retryable() {
    let dir = TempDir::new().unwrap();
    let peers = Arc::new(LocalPeers::new());
    let replica = open_shard(&dir, &ShardInfo::new("users", 1, 0, 1, 1), &LogConfig::default());

    let follower = Follower::new(replica, peers, fast_follow());
    let spec = FollowSpec::new(PeerSource::new(ClusterShard::new(0, 0), "gone:9001"), 1, 1);
    let err = follower
        .follow(&spec, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_follower_skips_refused_merge() {
    let dir = TempDir::new().unwrap();
    let peers = Arc::new(LocalPeers::new());
    let source = open_shard(&dir, &ShardInfo::new("users", 0, 0, 1, 1), &LogConfig::default());
    let replica = open_shard(&dir, &ShardInfo::new("users", 1, 0, 1, 1), &LogConfig::default());
    peers.register("a:9001", source.clone());

    source.put(b"k", b"abc".to_vec(), 0).unwrap();
    // a numeric merge over a text value, logged by an older writer
    source
        .log()
        .append(&LogEntry::merge(
            partition_hash(b"k"),
            timestamp_now_nanos(),
            MergeType::SumFloat64,
            b"k".to_vec(),
            1.0f64.to_le_bytes().to_vec(),
        ))
        .unwrap();
    source.put(b"after", b"ok".to_vec(), 0).unwrap();

    let follower = Follower::new(replica.clone(), peers.clone(), fast_follow());
    let spec = FollowSpec::new(PeerSource::new(ClusterShard::new(0, 0), "a:9001"), 1, 1);
    let cancel = CancellationToken::new();
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { follower.follow(&spec, &cancel).await })
    };

    wait_until("entry after the merge", || replica.get(b"after").unwrap().is_some()).await;
    assert_eq!(replica.get(b"k").unwrap().unwrap().value, b"abc".to_vec());

    source.put(b"later", b"still".to_vec(), 0).unwrap();
    wait_until("later entry", || replica.get(b"later").unwrap().is_some()).await;

    cancel.cancel();
    task.await.unwrap().unwrap();
}
