//! Cluster tests: store nodes driven by registry events

use ringkv::common::{jump_hash, partition_hash, FollowConfig, LogConfig, StoreConfig};
use ringkv::ops::compact_shard;
use ringkv::store::{LocalPeers, Shard, StoreNode};
use ringkv::topology::{ShardStatus, StoreResource, TopologyRegistry};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct TestNode {
    node: Arc<StoreNode>,
    _dir: TempDir,
}

fn start_node(
    name: &str,
    server_id: u32,
    registry: &Arc<TopologyRegistry>,
    peers: &Arc<LocalPeers>,
    cancel: &CancellationToken,
) -> TestNode {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig {
        server_id,
        data_dir: dir.path().to_path_buf(),
        log: LogConfig::default(),
        follow: FollowConfig {
            batch_limit: 64,
            retry_interval_ms: 20,
            cursor_flush_interval_ms: 20,
            cursor_flush_entries: 16,
        },
        log_level: "debug".into(),
    };
    let resource = StoreResource::new(format!("{}:9000", name), format!("{}:9001", name));
    let node = Arc::new(StoreNode::in_process(
        config,
        "dc1",
        resource,
        registry.clone(),
        peers.clone(),
    ));
    node.run(cancel.clone());
    TestNode { node, _dir: dir }
}

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

fn ready(node: &StoreNode, shard_id: u32) -> bool {
    node.shard("users", shard_id)
        .map_or(false, |s| s.status() == ShardStatus::Ready)
}

fn has_key(shard: &Shard, key: &[u8]) -> bool {
    shard.get(key).unwrap().is_some()
}

#[tokio::test]
async fn test_replicas_follow_each_other() {
    let registry = Arc::new(TopologyRegistry::new());
    let peers = Arc::new(LocalPeers::new());
    let cancel = CancellationToken::new();
    let a = start_node("a", 0, &registry, &peers, &cancel);
    let b = start_node("b", 1, &registry, &peers, &cancel);

    let stores = [a.node.resource().clone(), b.node.resource().clone()];
    registry
        .create_cluster("users", "dc1", 2, &stores)
        .await
        .unwrap();

    wait_until("all replicas ready", || {
        [&a, &b].iter().all(|n| ready(&n.node, 0) && ready(&n.node, 1))
    })
    .await;
    assert_eq!(a.node.shard_ids("users"), vec![0, 1]);
    assert_eq!(b.node.shard_ids("users"), vec![0, 1]);

    // writes on either replica reach the other one
    let key0 = &keys_for(0, 2, 1)[0];
    let key1 = &keys_for(1, 2, 1)[0];
    let a0 = a.node.shard("users", 0).unwrap();
    let b1 = b.node.shard("users", 1).unwrap();
    a0.put(key0, b"from a".to_vec(), 0).unwrap();
    b1.put(key1, b"from b".to_vec(), 0).unwrap();

    let b0 = b.node.shard("users", 0).unwrap();
    let a1 = a.node.shard("users", 1).unwrap();
    wait_until("a -> b", || has_key(&b0, key0)).await;
    wait_until("b -> a", || has_key(&a1, key1)).await;
    assert_eq!(b0.get(key0).unwrap().unwrap().value, b"from a".to_vec());

    registry.delete_keyspace("users").await.unwrap();
    wait_until("shards dropped", || {
        a.node.shard_ids("users").is_empty() && b.node.shard_ids("users").is_empty()
    })
    .await;
    cancel.cancel();
}

#[tokio::test]
async fn test_grow_cluster_moves_key_range() {
    let registry = Arc::new(TopologyRegistry::new());
    let peers = Arc::new(LocalPeers::new());
    let cancel = CancellationToken::new();
    let a = start_node("a", 0, &registry, &peers, &cancel);
    let b = start_node("b", 1, &registry, &peers, &cancel);

    registry
        .create_cluster("users", "dc1", 1, &[a.node.resource().clone()])
        .await
        .unwrap();
    wait_until("shard 0 ready", || ready(&a.node, 0)).await;
    let a0 = a.node.shard("users", 0).unwrap();

    let moving = keys_for(1, 2, 20);
    let staying = keys_for(0, 2, 20);
    for key in moving.iter().chain(&staying) {
        a0.put(key, b"v".to_vec(), 0).unwrap();
    }

    let planned = registry
        .resize_cluster("users", "dc1", 2, &[b.node.resource().clone()])
        .await
        .unwrap();
    assert_eq!(planned.len(), 1);
    assert!(planned[0].info.is_candidate);

    wait_until("candidate ready", || ready(&b.node, 1)).await;
    let b1 = b.node.shard("users", 1).unwrap();
    assert!(moving.iter().all(|k| has_key(&b1, k)));
    assert!(staying.iter().all(|k| !has_key(&b1, k)));

    // writes still land on the old owner until cutover, and are forwarded
    let late = &keys_for(1, 2, 21)[20];
    a0.put(late, b"late".to_vec(), 0).unwrap();
    wait_until("transitional follow", || has_key(&b1, late)).await;
    let supervisor = b.node.supervisor("users", 1).unwrap();
    assert!(supervisor.is_candidate());
    assert!(supervisor.is_following_transitionally());

    registry.complete_transition("users", "dc1").await.unwrap();
    wait_until("cutover", || !supervisor.is_candidate()).await;
    assert!(!supervisor.is_following_transitionally());
    wait_until("old shard resized", || a0.cluster_size() == 2).await;

    let ring = registry.cluster("users", "dc1").unwrap();
    assert!(!ring.is_transitioning());
    assert_eq!(ring.current_size(), 2);

    let report = compact_shard(&a0, 2).unwrap();
    assert_eq!(report.dropped(), 21);
    assert!(staying.iter().all(|k| has_key(&a0, k)));
    assert!(!has_key(&a0, late));
    cancel.cancel();
}

#[tokio::test]
async fn test_shrink_cluster_drains_retired_shard() {
    let registry = Arc::new(TopologyRegistry::new());
    let peers = Arc::new(LocalPeers::new());
    let cancel = CancellationToken::new();
    let a = start_node("a", 0, &registry, &peers, &cancel);
    let b = start_node("b", 1, &registry, &peers, &cancel);
    let c = start_node("c", 2, &registry, &peers, &cancel);

    let stores = [
        a.node.resource().clone(),
        b.node.resource().clone(),
        c.node.resource().clone(),
    ];
    registry
        .create_cluster("users", "dc1", 1, &stores)
        .await
        .unwrap();
    wait_until("all shards ready", || {
        ready(&a.node, 0) && ready(&b.node, 1) && ready(&c.node, 2)
    })
    .await;

    let c2 = c.node.shard("users", 2).unwrap();
    let retired = keys_for(2, 3, 10);
    for key in &retired {
        c2.put(key, b"v".to_vec(), 0).unwrap();
    }

    let planned = registry
        .resize_cluster("users", "dc1", 2, &[])
        .await
        .unwrap();
    assert!(planned.is_empty());

    let a0 = a.node.shard("users", 0).unwrap();
    let b1 = b.node.shard("users", 1).unwrap();
    let owner = |key: &[u8]| {
        if jump_hash(partition_hash(key), 2) == 0 {
            a0.clone()
        } else {
            b1.clone()
        }
    };
    wait_until("retired keys copied", || {
        retired.iter().all(|k| has_key(&owner(k), k))
    })
    .await;

    // the retiring shard keeps taking writes until the transition completes
    let late = &keys_for(2, 3, 11)[10];
    c2.put(late, b"late".to_vec(), 0).unwrap();
    wait_until("transitional follow", || has_key(&owner(late), late)).await;

    registry.complete_transition("users", "dc1").await.unwrap();
    wait_until("retired shard dropped", || c.node.shard_ids("users").is_empty()).await;
    wait_until("survivors resized", || {
        a0.cluster_size() == 2 && b1.cluster_size() == 2
    })
    .await;
    for (node, shard_id) in [(&a.node, 0), (&b.node, 1)] {
        let supervisor = node.supervisor("users", shard_id).unwrap();
        assert!(!supervisor.is_following_transitionally());
    }

    let ring = registry.cluster("users", "dc1").unwrap();
    assert!(!ring.is_transitioning());
    assert_eq!(ring.current_size(), 2);
    for key in retired.iter().chain(std::iter::once(late)) {
        let shard_id = ring.find_shard_id(partition_hash(key));
        let shard = if shard_id == 0 { &a0 } else { &b1 };
        assert!(has_key(shard, key));
    }
    cancel.cancel();
}

#[tokio::test]
async fn test_replace_node_moves_replica() {
    let registry = Arc::new(TopologyRegistry::new());
    let peers = Arc::new(LocalPeers::new());
    let cancel = CancellationToken::new();
    let a = start_node("a", 0, &registry, &peers, &cancel);
    let b = start_node("b", 1, &registry, &peers, &cancel);
    let c = start_node("c", 1, &registry, &peers, &cancel);

    let stores = [a.node.resource().clone(), b.node.resource().clone()];
    registry
        .create_cluster("users", "dc1", 1, &stores)
        .await
        .unwrap();
    wait_until("shards ready", || ready(&a.node, 0) && ready(&b.node, 1)).await;

    let b1 = b.node.shard("users", 1).unwrap();
    let keys = keys_for(1, 2, 10);
    for key in &keys {
        b1.put(key, b"v".to_vec(), 0).unwrap();
    }

    let planned = registry
        .replace_node("users", "dc1", 1, c.node.resource().clone())
        .await
        .unwrap();
    assert_eq!(planned.len(), 1);
    assert!(planned[0].info.is_candidate);

    wait_until("replacement ready", || ready(&c.node, 1)).await;
    let c1 = c.node.shard("users", 1).unwrap();
    assert!(keys.iter().all(|k| has_key(&c1, k)));

    let late = &keys_for(1, 2, 11)[10];
    b1.put(late, b"late".to_vec(), 0).unwrap();
    wait_until("transitional follow", || has_key(&c1, late)).await;
    let supervisor = c.node.supervisor("users", 1).unwrap();
    assert!(supervisor.is_candidate());

    registry.complete_transition("users", "dc1").await.unwrap();
    wait_until("cutover", || !supervisor.is_candidate()).await;
    assert!(!supervisor.is_following_transitionally());
    wait_until("old replica dropped", || b.node.shard_ids("users").is_empty()).await;

    let ring = registry.cluster("users", "dc1").unwrap();
    let topology = ring.snapshot();
    let placed = topology.current().replica(1, 1).unwrap();
    assert_eq!(placed.store.address, c.node.resource().address);
    assert!(!placed.info.is_candidate);
    assert_eq!(a.node.shard_ids("users"), vec![0]);
    cancel.cancel();
}
