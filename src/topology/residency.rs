//! Replica residency
//!
//! Pure functions deciding which shard replicas live on which server. A shard
//! `s` is replicated on servers `s, s+1, ..., s+rf-1` (mod cluster size), so
//! server `v` hosts shards `v, v-1, ..., v-rf+1` (mod cluster size).

use serde::{Deserialize, Serialize};

/// A (shard, host) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterShard {
    pub shard_id: u32,
    pub server_id: u32,
}

impl ClusterShard {
    pub fn new(shard_id: u32, server_id: u32) -> Self {
        Self {
            shard_id,
            server_id,
        }
    }

    /// The shard's primary replica, `shard_id == server_id`
    pub fn primary(id: u32) -> Self {
        Self::new(id, id)
    }
}

impl std::fmt::Display for ClusterShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.server_id, self.shard_id)
    }
}

fn replica_count(cluster_size: u32, replication_factor: u32) -> u32 {
    replication_factor.min(cluster_size)
}

/// Every replica of `shard_id`, primary first.
///
/// `server_id` is accepted for symmetry with [`peer_shards`] and does not
/// affect the result.
pub fn partition_shards(
    _server_id: u32,
    shard_id: u32,
    cluster_size: u32,
    replication_factor: u32,
) -> Vec<ClusterShard> {
    if shard_id >= cluster_size {
        return Vec::new();
    }
    (0..replica_count(cluster_size, replication_factor))
        .map(|i| ClusterShard::new(shard_id, (shard_id + i) % cluster_size))
        .collect()
}

/// Replicas of `shard_id` hosted anywhere but on `server_id`
pub fn peer_shards(
    server_id: u32,
    shard_id: u32,
    cluster_size: u32,
    replication_factor: u32,
) -> Vec<ClusterShard> {
    partition_shards(server_id, shard_id, cluster_size, replication_factor)
        .into_iter()
        .filter(|s| s.server_id != server_id)
        .collect()
}

/// Shards hosted by `server_id`; empty when the server is outside the cluster
pub fn local_shards(server_id: u32, cluster_size: u32, replication_factor: u32) -> Vec<ClusterShard> {
    if server_id >= cluster_size {
        return Vec::new();
    }
    (0..replica_count(cluster_size, replication_factor))
        .map(|i| ClusterShard::new((server_id + cluster_size - i) % cluster_size, server_id))
        .collect()
}

pub fn is_shard_local(
    shard_id: u32,
    server_id: u32,
    cluster_size: u32,
    replication_factor: u32,
) -> bool {
    local_shards(server_id, cluster_size, replication_factor)
        .iter()
        .any(|s| s.shard_id == shard_id)
}

pub fn shard_list_contains(shards: &[ClusterShard], target: &ClusterShard) -> bool {
    shards.contains(target)
}

/// Primaries `{(i, i) : i in [from, to)}`
pub(crate) fn primaries(from: u32, to: u32) -> Vec<ClusterShard> {
    (from..to).map(ClusterShard::primary).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_partition_shards_wraps() {
        let shards = partition_shards(0, 4, 5, 3);
        assert_eq!(
            shards,
            vec![
                ClusterShard::new(4, 4),
                ClusterShard::new(4, 0),
                ClusterShard::new(4, 1)
            ]
        );
        assert!(partition_shards(0, 5, 5, 3).is_empty());
    }

    #[test]
    fn test_replication_factor_capped_by_size() {
        assert_eq!(partition_shards(0, 1, 2, 5).len(), 2);
        assert_eq!(local_shards(1, 2, 5).len(), 2);
    }

    #[test]
    fn test_local_shards_out_of_range() {
        assert!(local_shards(7, 5, 3).is_empty());
        assert!(!is_shard_local(0, 7, 5, 3));
    }

    #[test]
    fn test_residency_properties() {
        for size in 1..=9u32 {
            for rf in 1..=size {
                for server in 0..size {
                    let local = local_shards(server, size, rf);
                    assert_eq!(local.len() as u32, rf.min(size));
                    let ids: HashSet<u32> = local.iter().map(|s| s.shard_id).collect();
                    assert_eq!(ids.len(), local.len());
                    assert!(ids.iter().all(|&id| id < size));

                    for shard in 0..size {
                        assert_eq!(
                            is_shard_local(shard, server, size, rf),
                            ids.contains(&shard)
                        );

                        let peers = peer_shards(server, shard, size, rf);
                        assert!(peers.iter().all(|p| p.server_id != server));

                        let mut all = partition_shards(server, shard, size, rf);
                        let self_entry = ClusterShard::new(shard, server);
                        let mut rebuilt = peers.clone();
                        if all.contains(&self_entry) {
                            rebuilt.push(self_entry);
                        }
                        all.sort();
                        rebuilt.sort();
                        assert_eq!(all, rebuilt);
                    }
                }
            }
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(ClusterShard::new(3, 1).to_string(), "1.3");
        assert!(shard_list_contains(&primaries(0, 3), &ClusterShard::primary(2)));
    }
}
