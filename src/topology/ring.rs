//! Cluster ring
//!
//! The shard -> replica map of one keyspace in one data center. During a
//! resize or node replacement the ring carries a second, candidate ring; the
//! two are modelled as one `Topology` value so a promotion swaps state in a
//! single step under the write lock.

use crate::common::{jump_hash, Error, Result};
use crate::topology::node::{Node, ShardInfo, StoreResource};
use parking_lot::RwLock;

/// One replica placement inside a ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    pub store: StoreResource,
    pub info: ShardInfo,
}

impl ClusterNode {
    /// Distance from the shard's primary, 0 for the primary itself
    fn replica_offset(&self, ring_len: u32) -> u32 {
        let ring_len = ring_len.max(1);
        (self.info.server_id + ring_len - self.info.shard_id % ring_len) % ring_len
    }
}

/// A single ring: replica groups indexed by shard id, each sorted by replica offset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ring {
    expected_size: u32,
    replication_factor: u32,
    shards: Vec<Vec<ClusterNode>>,
}

impl Ring {
    pub fn new(expected_size: u32, replication_factor: u32) -> Self {
        Self {
            expected_size,
            replication_factor,
            shards: vec![Vec::new(); expected_size as usize],
        }
    }

    pub fn expected_size(&self) -> u32 {
        self.expected_size
    }

    pub fn replication_factor(&self) -> u32 {
        self.replication_factor
    }

    /// One past the highest shard id that has at least one replica
    pub fn current_size(&self) -> u32 {
        self.shards
            .iter()
            .rposition(|group| !group.is_empty())
            .map(|i| i as u32 + 1)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.current_size() == 0
    }

    fn set_shard(&mut self, store: &StoreResource, info: ShardInfo) -> Option<ShardInfo> {
        let shard_id = info.shard_id as usize;
        if self.shards.len() <= shard_id {
            self.shards.resize(shard_id + 1, Vec::new());
        }
        if info.cluster_size > 0 {
            self.expected_size = info.cluster_size;
        }
        if info.replication_factor > 0 {
            self.replication_factor = info.replication_factor;
        }

        let ring_len = self.shards.len() as u32;
        let group = &mut self.shards[shard_id];
        if let Some(existing) = group
            .iter_mut()
            .find(|n| n.store.address == store.address && n.info.shard_id == info.shard_id)
        {
            let old = std::mem::replace(&mut existing.info, info);
            existing.store = store.clone();
            return Some(old);
        }

        group.push(ClusterNode {
            store: store.clone(),
            info,
        });
        group.sort_by_key(|n| n.replica_offset(ring_len));
        None
    }

    fn remove_shard(&mut self, store: &StoreResource, shard_id: u32) -> Option<ClusterNode> {
        let group = self.shards.get_mut(shard_id as usize)?;
        let pos = group
            .iter()
            .position(|n| n.store.address == store.address && n.info.shard_id == shard_id)?;
        Some(group.remove(pos))
    }

    fn take_replica(&mut self, server_id: u32, shard_id: u32) -> Option<ClusterNode> {
        let group = self.shards.get_mut(shard_id as usize)?;
        let pos = group.iter().position(|n| n.info.server_id == server_id)?;
        Some(group.remove(pos))
    }

    pub fn replica(&self, shard_id: u32, server_id: u32) -> Option<&ClusterNode> {
        self.shards
            .get(shard_id as usize)?
            .iter()
            .find(|n| n.info.server_id == server_id)
    }

    /// Replicas of one shard, primary first
    pub fn replicas(&self, shard_id: u32) -> &[ClusterNode] {
        self.shards
            .get(shard_id as usize)
            .map(|g| g.as_slice())
            .unwrap_or(&[])
    }

    pub fn uses_store(&self, address: &str) -> bool {
        self.shards
            .iter()
            .flatten()
            .any(|n| n.store.address == address)
    }

    pub fn all_shards(&self) -> impl Iterator<Item = &ClusterNode> {
        self.shards.iter().flatten()
    }

    /// Server-level view of one host in this ring
    pub fn node_for_server(&self, server_id: u32) -> Option<Node> {
        let mut node: Option<Node> = None;
        for placed in self.all_shards().filter(|n| n.info.server_id == server_id) {
            node.get_or_insert_with(|| Node::new(server_id, placed.store.clone()))
                .set_shard(placed.info.clone());
        }
        node
    }
}

impl std::fmt::Display for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[")?;
        for (i, group) in self.shards.iter().enumerate() {
            if i != 0 {
                f.write_str(" ")?;
            }
            if group.is_empty() {
                f.write_str("_")?;
                continue;
            }
            write!(f, "{}@", i)?;
            for (j, n) in group.iter().enumerate() {
                if j != 0 {
                    f.write_str(",")?;
                }
                write!(f, "{}", n.info.server_id)?;
            }
        }
        write!(f, "] size {}/{}", self.current_size(), self.expected_size)
    }
}

/// Stable ring, or a ring in the middle of a resize/replace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    Stable(Ring),
    Transitioning { current: Ring, next: Ring },
}

impl Topology {
    pub fn current(&self) -> &Ring {
        match self {
            Topology::Stable(ring) => ring,
            Topology::Transitioning { current, .. } => current,
        }
    }

    pub fn next(&self) -> Option<&Ring> {
        match self {
            Topology::Stable(_) => None,
            Topology::Transitioning { next, .. } => Some(next),
        }
    }
}

/// Picks which replica of a shard a lookup targets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessOption {
    pub replica: u32,
}

impl AccessOption {
    pub fn primary() -> Self {
        Self::default()
    }

    pub fn replica(replica: u32) -> Self {
        Self { replica }
    }

    /// Maps `(shard, ring size)` to `(target server, replica offset)`
    pub fn target(&self, shard_id: u32, ring_size: u32) -> (u32, u32) {
        let ring_size = ring_size.max(1);
        ((shard_id + self.replica) % ring_size, self.replica)
    }
}

/// Topology of one keyspace in one data center
#[derive(Debug)]
pub struct ClusterRing {
    keyspace: String,
    data_center: String,
    topology: RwLock<Topology>,
}

impl ClusterRing {
    pub fn new(
        keyspace: impl Into<String>,
        data_center: impl Into<String>,
        expected_size: u32,
        replication_factor: u32,
    ) -> Result<Self> {
        validate_size(expected_size, replication_factor)?;
        Ok(Self {
            keyspace: keyspace.into(),
            data_center: data_center.into(),
            topology: RwLock::new(Topology::Stable(Ring::new(expected_size, replication_factor))),
        })
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn data_center(&self) -> &str {
        &self.data_center
    }

    /// Insert or update a replica; candidates land in the next ring, which is
    /// created on demand. Returns the replaced `ShardInfo`, if any.
    pub fn set_shard(&self, store: &StoreResource, info: ShardInfo) -> Result<Option<ShardInfo>> {
        validate_size(info.cluster_size, info.replication_factor)?;
        let mut topology = self.topology.write();

        if !info.is_candidate {
            return Ok(match &mut *topology {
                Topology::Stable(ring) => ring.set_shard(store, info),
                Topology::Transitioning { current, .. } => current.set_shard(store, info),
            });
        }

        let topo = std::mem::replace(&mut *topology, Topology::Stable(Ring::default()));
        let (current, mut next) = match topo {
            Topology::Stable(current) => {
                let next = Ring::new(info.cluster_size, info.replication_factor);
                (current, next)
            }
            Topology::Transitioning { current, next } => (current, next),
        };
        let old = next.set_shard(store, info);
        *topology = Topology::Transitioning { current, next };
        Ok(old)
    }

    /// Remove a replica. Returns true when the store no longer hosts anything
    /// in this keyspace, in either ring.
    pub fn remove_shard(&self, store: &StoreResource, info: &ShardInfo) -> bool {
        let mut topology = self.topology.write();
        match &mut *topology {
            Topology::Stable(ring) => {
                ring.remove_shard(store, info.shard_id);
            }
            Topology::Transitioning { current, next } => {
                if info.is_candidate {
                    next.remove_shard(store, info.shard_id);
                } else {
                    current.remove_shard(store, info.shard_id);
                }
            }
        }
        !uses_store(&topology, &store.address)
    }

    /// True when the store hosts a replica in either ring
    pub fn uses_store(&self, address: &str) -> bool {
        uses_store(&self.topology.read(), address)
    }

    /// Shard owning a partition hash
    pub fn find_shard_id(&self, partition_hash: u64) -> u32 {
        jump_hash(partition_hash, self.current_size())
    }

    /// The node serving `shard_id` at the replica chosen by `option`, with the
    /// replica offset actually found
    pub fn get_node(&self, shard_id: u32, option: AccessOption) -> Option<(Node, u32)> {
        let topology = self.topology.read();
        let current = topology.current();
        let (server_id, replica) = option.target(shard_id, current.current_size());
        current.replica(shard_id, server_id)?;

        let mut node = current.node_for_server(server_id)?;
        if let Some(next) = topology.next() {
            if let Some(candidate) = next.node_for_server(server_id) {
                if candidate.store.address != node.store.address {
                    node.alternative = Some(candidate.store.admin_address.clone());
                }
            }
        }
        Some((node, replica))
    }

    /// Open a transition towards a ring of `expected_size`
    pub fn set_next_cluster(&self, expected_size: u32, replication_factor: u32) -> Result<()> {
        validate_size(expected_size, replication_factor)?;
        let mut topology = self.topology.write();
        let topo = std::mem::replace(&mut *topology, Topology::Stable(Ring::default()));
        let current = match topo {
            Topology::Stable(current) => current,
            Topology::Transitioning { current, next } => {
                tracing::warn!("{}: dropping unfinished next ring {}", self.keyspace, next);
                current
            }
        };
        *topology = Topology::Transitioning {
            current,
            next: Ring::new(expected_size, replication_factor),
        };
        Ok(())
    }

    /// Abandon the transition; returns the dropped candidate ring
    pub fn remove_next_cluster(&self) -> Option<Ring> {
        let mut topology = self.topology.write();
        let topo = std::mem::replace(&mut *topology, Topology::Stable(Ring::default()));
        let (current, dropped) = match topo {
            Topology::Stable(current) => (current, None),
            Topology::Transitioning { current, next } => (current, Some(next)),
        };
        *topology = Topology::Stable(current);
        dropped
    }

    /// Move one candidate from the next ring into the current ring, replacing
    /// whatever replica held the same (server, shard) slot. The transition
    /// collapses back to `Stable` once the next ring is empty.
    ///
    /// Returns the displaced replica of the current ring, or `NotFound` when
    /// no such candidate exists.
    pub fn promote_candidate(&self, info: &ShardInfo) -> Result<Option<ClusterNode>> {
        let mut topology = self.topology.write();
        let topo = std::mem::replace(&mut *topology, Topology::Stable(Ring::default()));

        let (mut current, mut next) = match topo {
            Topology::Transitioning { current, next } => (current, next),
            stable @ Topology::Stable(_) => {
                *topology = stable;
                return Err(Error::NotFound(format!(
                    "{}: no transition in progress",
                    self.keyspace
                )));
            }
        };

        let Some(mut candidate) = next.take_replica(info.server_id, info.shard_id) else {
            *topology = Topology::Transitioning { current, next };
            return Err(Error::NotFound(format!(
                "{}: no candidate {}.{}",
                self.keyspace, info.server_id, info.shard_id
            )));
        };

        candidate.info.is_candidate = false;
        let displaced = current.take_replica(info.server_id, info.shard_id);
        current.set_shard(&candidate.store, candidate.info);
        *topology = if next.is_empty() {
            Topology::Stable(current)
        } else {
            Topology::Transitioning { current, next }
        };
        Ok(displaced)
    }

    pub fn current_size(&self) -> u32 {
        self.topology.read().current().current_size()
    }

    pub fn expected_size(&self) -> u32 {
        self.topology.read().current().expected_size()
    }

    pub fn replication_factor(&self) -> u32 {
        self.topology.read().current().replication_factor()
    }

    pub fn is_transitioning(&self) -> bool {
        matches!(*self.topology.read(), Topology::Transitioning { .. })
    }

    /// Expected size of the candidate ring, if a transition is in progress
    pub fn next_size(&self) -> Option<u32> {
        self.topology.read().next().map(|n| n.expected_size())
    }

    /// A copy of the whole topology, for inspection
    pub fn snapshot(&self) -> Topology {
        self.topology.read().clone()
    }
}

impl std::fmt::Display for ClusterRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topology = self.topology.read();
        write!(f, "{}@{} {}", self.keyspace, self.data_center, topology.current())?;
        if let Some(next) = topology.next() {
            write!(f, " -> {}", next)?;
        }
        Ok(())
    }
}

fn uses_store(topology: &Topology, address: &str) -> bool {
    topology.current().uses_store(address)
        || topology
            .next()
            .map(|n| n.uses_store(address))
            .unwrap_or(false)
}

pub(crate) fn validate_size(cluster_size: u32, replication_factor: u32) -> Result<()> {
    if cluster_size == 0 {
        return Err(Error::InvalidConfig("cluster size must be > 0".into()));
    }
    if replication_factor == 0 || replication_factor > cluster_size {
        return Err(Error::InvalidConfig(format!(
            "replication factor {} must be in [1, {}]",
            replication_factor, cluster_size
        )));
    }
    Ok(())
}
