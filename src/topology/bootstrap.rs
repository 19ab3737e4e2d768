//! Bootstrap planning
//!
//! Decides, for one shard replica and one topology transition, which peers it
//! must copy a snapshot from and which peers it must keep tailing until the
//! transition is cut over. Pure functions only; executing a plan lives in
//! `store::bootstrap`.

use crate::topology::residency::{is_shard_local, partition_shards, peer_shards, primaries, ClusterShard};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapRequest {
    pub server_id: u32,
    pub shard_id: u32,
    pub from_cluster_size: u32,
    pub to_cluster_size: u32,
    pub replication_factor: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapPlan {
    /// Peers to copy a snapshot from
    pub bootstrap_source: Vec<ClusterShard>,
    /// Copy from the most advanced source only, instead of draining every one
    pub pick_best_source: bool,
    /// Peers tailed until the transition is cut over
    pub transitional_follow_source: Vec<ClusterShard>,
    pub from_cluster_size: u32,
    pub to_cluster_size: u32,
    /// Restart without topology change
    pub is_normal_start: bool,
    pub normal_start_bootstrap_needed: bool,
}

impl BootstrapPlan {
    fn empty(req: &BootstrapRequest) -> Self {
        Self {
            from_cluster_size: req.from_cluster_size,
            to_cluster_size: req.to_cluster_size,
            ..Default::default()
        }
    }

    /// Plan for a replica restarting inside an unchanged ring: check its peers
    /// and copy only when it can no longer resume tailing them.
    pub fn normal_start(
        server_id: u32,
        shard_id: u32,
        cluster_size: u32,
        replication_factor: u32,
        bootstrap_needed: bool,
    ) -> Self {
        Self {
            bootstrap_source: peer_shards(server_id, shard_id, cluster_size, replication_factor),
            pick_best_source: true,
            transitional_follow_source: Vec::new(),
            from_cluster_size: cluster_size,
            to_cluster_size: cluster_size,
            is_normal_start: true,
            normal_start_bootstrap_needed: bootstrap_needed,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bootstrap_source.is_empty() && self.transitional_follow_source.is_empty()
    }
}

/// Build the copy/follow plan of one replica for a resize or replacement.
pub fn plan_with_topo_change(req: &BootstrapRequest) -> BootstrapPlan {
    let mut plan = BootstrapPlan::empty(req);
    let BootstrapRequest {
        server_id,
        shard_id,
        from_cluster_size: from,
        to_cluster_size: to,
        replication_factor: rf,
    } = *req;

    if from == to {
        // replacing a server: catch up from the freshest replica, and keep
        // tailing the server being replaced until cutover
        plan.bootstrap_source = partition_shards(server_id, shard_id, to, rf);
        plan.pick_best_source = true;
        plan.transitional_follow_source = vec![ClusterShard::new(shard_id, server_id)];
        return plan;
    }

    if from < to {
        if shard_id >= from {
            // a new shard ingests from every old primary and relies on its
            // own filter to keep only its key range
            plan.bootstrap_source = primaries(0, from);
            plan.transitional_follow_source = plan.bootstrap_source.clone();
            return plan;
        }
        let local_after = is_shard_local(shard_id, server_id, to, rf);
        let local_before = is_shard_local(shard_id, server_id, from, rf);
        if local_after && !local_before {
            plan.bootstrap_source = partition_shards(server_id, shard_id, from, rf);
            plan.pick_best_source = true;
        }
        return plan;
    }

    // shrinking
    if server_id >= to || shard_id >= to {
        return plan;
    }
    if !is_shard_local(shard_id, server_id, to, rf) {
        return plan;
    }
    if !is_shard_local(shard_id, server_id, from, rf) {
        plan.bootstrap_source = partition_shards(server_id, shard_id, from, rf);
        plan.pick_best_source = true;
        plan.transitional_follow_source = primaries(to, from);
    } else {
        // retiring primaries hold disjoint data, drain all of them
        plan.bootstrap_source = primaries(to, from);
        plan.transitional_follow_source = plan.bootstrap_source.clone();
    }
    plan
}

fn write_shards(f: &mut std::fmt::Formatter<'_>, shards: &[ClusterShard]) -> std::fmt::Result {
    f.write_str("[")?;
    for (i, s) in shards.iter().enumerate() {
        if i != 0 {
            f.write_str(",")?;
        }
        write!(f, "{}", s)?;
    }
    f.write_str("]")
}

impl std::fmt::Display for BootstrapPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_normal_start {
            if self.normal_start_bootstrap_needed {
                f.write_str("check peer shards, ")?;
            }
            return f.write_str("normal start");
        }
        if !self.bootstrap_source.is_empty() {
            f.write_str("bootstraps from ")?;
            if self.pick_best_source {
                f.write_str("one of ")?;
            }
            write_shards(f, &self.bootstrap_source)?;
            f.write_str(" ")?;
        }
        if !self.transitional_follow_source.is_empty() {
            f.write_str("temporarily follows ")?;
            write_shards(f, &self.transitional_follow_source)?;
            f.write_str(" ")?;
        }
        f.write_str("bootstrap start")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(server_id: u32, shard_id: u32, from: u32, to: u32, rf: u32) -> BootstrapRequest {
        BootstrapRequest {
            server_id,
            shard_id,
            from_cluster_size: from,
            to_cluster_size: to,
            replication_factor: rf,
        }
    }

    fn servers(shards: &[ClusterShard]) -> Vec<u32> {
        shards.iter().map(|s| s.server_id).collect()
    }

    #[test]
    fn test_replace_node() {
        let plan = plan_with_topo_change(&req(2, 1, 5, 5, 3));
        assert!(plan.pick_best_source);
        assert_eq!(servers(&plan.bootstrap_source), vec![1, 2, 3]);
        assert_eq!(plan.transitional_follow_source, vec![ClusterShard::new(1, 2)]);
    }

    #[test]
    fn test_grow_new_shard() {
        let plan = plan_with_topo_change(&req(6, 6, 6, 7, 1));
        assert_eq!(servers(&plan.bootstrap_source), vec![0, 1, 2, 3, 4, 5]);
        assert!(plan
            .bootstrap_source
            .iter()
            .all(|s| s.server_id == s.shard_id));
        assert!(!plan.pick_best_source);
        assert_eq!(plan.transitional_follow_source, plan.bootstrap_source);
    }

    #[test]
    fn test_grow_old_shard() {
        // server 3 keeps shard 3 and 2 in both rings
        assert!(plan_with_topo_change(&req(3, 2, 4, 5, 2)).is_empty());
        // server 0 hosted shard 3 in the ring of 4, not in the ring of 5
        assert!(plan_with_topo_change(&req(0, 3, 4, 5, 2)).is_empty());
        // server 4 is new and picks up old shard 3
        let plan = plan_with_topo_change(&req(4, 3, 4, 5, 2));
        assert!(plan.pick_best_source);
        assert_eq!(servers(&plan.bootstrap_source), vec![3, 0]);
        assert!(plan.transitional_follow_source.is_empty());
    }

    #[test]
    fn test_shrink() {
        assert!(plan_with_topo_change(&req(7, 2, 10, 6, 3)).is_empty());
        assert!(plan_with_topo_change(&req(2, 7, 10, 6, 3)).is_empty());

        let plan = plan_with_topo_change(&req(5, 4, 10, 6, 3));
        assert!(!plan.pick_best_source);
        assert_eq!(servers(&plan.bootstrap_source), vec![6, 7, 8, 9]);
        assert_eq!(plan.transitional_follow_source, plan.bootstrap_source);

        // server 1 newly hosts shard 5 once the ring wraps at 6
        let plan = plan_with_topo_change(&req(1, 5, 10, 6, 3));
        assert!(plan.pick_best_source);
        assert_eq!(servers(&plan.bootstrap_source), vec![5, 6, 7]);
        assert_eq!(servers(&plan.transitional_follow_source), vec![6, 7, 8, 9]);
    }

    #[test]
    fn test_plan_is_deterministic() {
        for from in 1..=8u32 {
            for to in 1..=8u32 {
                let rf = from.min(to).min(3);
                for server in 0..from.max(to) {
                    for shard in 0..from.max(to) {
                        let r = req(server, shard, from, to, rf);
                        assert_eq!(plan_with_topo_change(&r), plan_with_topo_change(&r));
                    }
                }
            }
        }
    }

    #[test]
    fn test_display() {
        let plan = plan_with_topo_change(&req(2, 1, 5, 5, 2));
        assert_eq!(
            plan.to_string(),
            "bootstraps from one of [1.1,2.1] temporarily follows [2.1] bootstrap start"
        );
        assert_eq!(
            BootstrapPlan::normal_start(0, 0, 3, 2, true).to_string(),
            "check peer shards, normal start"
        );
        assert_eq!(BootstrapPlan::normal_start(0, 0, 3, 2, false).to_string(), "normal start");
    }
}
