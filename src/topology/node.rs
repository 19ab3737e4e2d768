//! Store nodes and the shard replicas they host

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ShardStatus {
    Creating,
    Ready,
    Deleted,
}

impl std::fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ShardStatus::Creating => "CREATING",
            ShardStatus::Ready => "READY",
            ShardStatus::Deleted => "DELETED",
        };
        f.write_str(s)
    }
}

/// One shard replica as announced by its store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub keyspace: String,
    pub server_id: u32,
    pub shard_id: u32,
    pub cluster_size: u32,
    pub replication_factor: u32,
    #[serde(default)]
    pub is_candidate: bool,
    pub status: ShardStatus,
}

impl ShardInfo {
    pub fn new(
        keyspace: impl Into<String>,
        server_id: u32,
        shard_id: u32,
        cluster_size: u32,
        replication_factor: u32,
    ) -> Self {
        Self {
            keyspace: keyspace.into(),
            server_id,
            shard_id,
            cluster_size,
            replication_factor,
            is_candidate: false,
            status: ShardStatus::Creating,
        }
    }

    pub fn candidate(mut self) -> Self {
        self.is_candidate = true;
        self
    }

    pub fn with_status(mut self, status: ShardStatus) -> Self {
        self.status = status;
        self
    }

    /// `keyspace.server.shard`
    pub fn identifier(&self) -> String {
        format!("{}.{}.{}", self.keyspace, self.server_id, self.shard_id)
    }
}

/// Where a store can be reached
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreResource {
    pub network: String,
    pub address: String,
    pub admin_address: String,
    #[serde(default)]
    pub data_center: String,
}

impl StoreResource {
    pub fn new(address: impl Into<String>, admin_address: impl Into<String>) -> Self {
        Self {
            network: "tcp".to_string(),
            address: address.into(),
            admin_address: admin_address.into(),
            data_center: String::new(),
        }
    }
}

/// A server of a cluster ring and the replicas it hosts there
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: u32,
    pub store: StoreResource,
    pub shards: BTreeMap<u32, ShardInfo>,
    /// Admin address of the node this one is replacing or being replaced by.
    /// Held as an address, not a handle, so replaced nodes can be dropped.
    pub alternative: Option<String>,
}

impl Node {
    pub fn new(id: u32, store: StoreResource) -> Self {
        Self {
            id,
            store,
            shards: BTreeMap::new(),
            alternative: None,
        }
    }

    pub fn shard(&self, shard_id: u32) -> Option<&ShardInfo> {
        self.shards.get(&shard_id)
    }

    /// Insert or replace a replica, returning the previous one
    pub fn set_shard(&mut self, info: ShardInfo) -> Option<ShardInfo> {
        self.shards.insert(info.shard_id, info)
    }

    pub fn remove_shard(&mut self, shard_id: u32) -> Option<ShardInfo> {
        self.shards.remove(&shard_id)
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_info_serde() {
        let info = ShardInfo::new("users", 1, 2, 5, 3).candidate();
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"status\":\"CREATING\""));
        let back: ShardInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
        assert_eq!(back.identifier(), "users.1.2");
    }

    #[test]
    fn test_node_shards() {
        let mut node = Node::new(1, StoreResource::new("10.0.0.1:8279", "10.0.0.1:8278"));
        assert!(node.set_shard(ShardInfo::new("users", 1, 1, 3, 2)).is_none());
        let old = node.set_shard(ShardInfo::new("users", 1, 1, 3, 2).with_status(ShardStatus::Ready));
        assert_eq!(old.map(|s| s.status), Some(ShardStatus::Creating));
        assert_eq!(node.shard(1).map(|s| s.status), Some(ShardStatus::Ready));
        node.remove_shard(1);
        assert!(node.is_empty());
    }
}
