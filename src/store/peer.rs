//! Peer RPC surface
//!
//! Message types for the three calls one store makes to another (check
//! binlog, tail binlog, bootstrap copy) and the `PeerConnector` seam the
//! follow and bootstrap loops talk through. `LocalPeers` connects shards
//! living in the same process.

use crate::binlog::{LogEntry, LogPosition, SegmentRange};
use crate::common::{Error, KeyValue, Result};
use crate::store::progress::CursorKey;
use crate::store::shard::Shard;
use crate::topology::{ClusterRing, ClusterShard};
use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A peer replica as seen by a follower: which (server, shard) and where
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerSource {
    pub shard: ClusterShard,
    pub admin_address: String,
}

impl PeerSource {
    pub fn new(shard: ClusterShard, admin_address: impl Into<String>) -> Self {
        Self {
            shard,
            admin_address: admin_address.into(),
        }
    }

    /// Resolve `shard` against the current ring of `ring`
    pub fn resolve(ring: &ClusterRing, shard: ClusterShard) -> Result<Self> {
        let topology = ring.snapshot();
        let placed = topology
            .current()
            .replica(shard.shard_id, shard.server_id)
            .ok_or_else(|| {
                Error::NotFound(format!("{} has no replica {}", ring.keyspace(), shard))
            })?;
        Ok(Self::new(shard, placed.store.admin_address.clone()))
    }

    pub fn cursor_key(&self) -> CursorKey {
        CursorKey::new(self.admin_address.clone(), self.shard.shard_id)
    }
}

impl std::fmt::Display for PeerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.shard, self.admin_address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailRequest {
    pub keyspace: String,
    pub shard_id: u32,
    pub segment: u32,
    pub offset: u64,
    pub limit: u32,
    /// Only forward entries owned by `target_shard_id` in a ring of this size
    pub target_cluster_size: Option<u32>,
    pub target_shard_id: Option<u32>,
    /// Follower identity, for logs
    pub origin: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TailResponse {
    Batch {
        entries: Vec<LogEntry>,
        next_segment: u32,
        next_offset: u64,
    },
    /// The requested segment is gone; the follower has to bootstrap again
    OutOfSync,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapCopyRequest {
    pub keyspace: String,
    pub shard_id: u32,
    /// Ring size the source shard owns keys under; 0 copies everything
    pub cluster_size: u32,
    pub target_cluster_size: Option<u32>,
    pub target_shard_id: Option<u32>,
    pub batch_size: usize,
    pub origin: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BootstrapCopyResponse {
    pub key_values: Vec<KeyValue>,
    /// Set on the final message: where to start tailing after the snapshot
    pub cursor: Option<LogPosition>,
}

pub type TailStream = BoxStream<'static, Result<TailResponse>>;
pub type CopyStream = BoxStream<'static, Result<BootstrapCopyResponse>>;

/// Client side of the store-to-store calls
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn check_binlog(&self, admin_address: &str, keyspace: &str, shard_id: u32)
        -> Result<SegmentRange>;

    async fn tail(&self, admin_address: &str, request: TailRequest) -> Result<TailStream>;

    async fn bootstrap_copy(
        &self,
        admin_address: &str,
        request: BootstrapCopyRequest,
    ) -> Result<CopyStream>;
}

type ShardKey = (String, String, u32);

/// In-process peers, keyed by admin address, keyspace and shard id.
///
/// Errors cross this boundary as gRPC statuses, the same way they would
/// between two processes.
#[derive(Default)]
pub struct LocalPeers {
    shards: RwLock<HashMap<ShardKey, Arc<Shard>>>,
}

impl LocalPeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, admin_address: &str, shard: Arc<Shard>) {
        let key = (
            admin_address.to_string(),
            shard.keyspace().to_string(),
            shard.shard_id(),
        );
        self.shards.write().insert(key, shard);
    }

    pub fn unregister(&self, admin_address: &str, keyspace: &str, shard_id: u32) -> Option<Arc<Shard>> {
        self.shards
            .write()
            .remove(&(admin_address.to_string(), keyspace.to_string(), shard_id))
    }

    fn lookup(&self, admin_address: &str, keyspace: &str, shard_id: u32) -> Result<Arc<Shard>> {
        self.shards
            .read()
            .get(&(admin_address.to_string(), keyspace.to_string(), shard_id))
            .cloned()
            .ok_or_else(|| {
                Error::ConnectionFailed(format!(
                    "{} has no shard {}.{}",
                    admin_address, keyspace, shard_id
                ))
            })
    }
}

fn over_the_wire<T>(result: Result<T>) -> Result<T> {
    result.map_err(|e| Error::from(e.to_grpc_status()))
}

#[async_trait]
impl PeerConnector for LocalPeers {
    async fn check_binlog(
        &self,
        admin_address: &str,
        keyspace: &str,
        shard_id: u32,
    ) -> Result<SegmentRange> {
        let shard = self.lookup(admin_address, keyspace, shard_id)?;
        over_the_wire(shard.check_binlog())
    }

    async fn tail(&self, admin_address: &str, request: TailRequest) -> Result<TailStream> {
        let shard = self.lookup(admin_address, &request.keyspace, request.shard_id)?;
        Ok(shard.tail_stream(request).map(over_the_wire).boxed())
    }

    async fn bootstrap_copy(
        &self,
        admin_address: &str,
        request: BootstrapCopyRequest,
    ) -> Result<CopyStream> {
        let shard = self.lookup(admin_address, &request.keyspace, request.shard_id)?;
        Ok(shard.bootstrap_copy(request).map(over_the_wire).boxed())
    }
}
