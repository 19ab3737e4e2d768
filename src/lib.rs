//! # ringkv
//!
//! Core of a sharded, replicated key-value store:
//! - Jump-hash cluster rings with replica residency and online
//!   resize/replace transitions
//! - Bootstrap planning for replicas joining a changing ring
//! - A segmented, tailable binlog per shard replica
//! - Followers that tail peer binlogs and apply entries last-writer-wins
//!
//! ## Architecture
//!
//! ```text
//!  TopologyEvent ──► TopologyRegistry ──► ShardEvent ──► StoreNode
//!                    (ClusterRing per                     │
//!                     keyspace/dc)                        ▼
//!                                                   ShardSupervisor
//!                                                   │ bootstrap  │ follow
//!                                                   ▼            ▼
//!    peer Shard ◄── BootstrapCopy / Tail ──────── Follower ──► LocalStore
//!    (binlog)
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Retained segments of one shard's binlog
//! ringkv-binlog --dir ./data/users/0_0/binlog range
//!
//! # Check every segment for corrupt frames
//! ringkv-binlog --dir ./data/users/0_0/binlog verify
//!
//! # Print entries of the latest segment
//! ringkv-binlog --dir ./data/users/0_0/binlog dump --limit 20
//! ```

#![allow(clippy::result_large_err)]

pub mod binlog;
pub mod common;
pub mod ops;
pub mod store;
pub mod topology;

// Re-export commonly used types
pub use common::{Error, Result, StoreConfig};
pub use store::{Shard, ShardSupervisor, StoreNode};
pub use topology::{ClusterRing, TopologyRegistry};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
