//! Shard replicas on one store: local write path, serve side of the peer
//! calls, followers, bootstrap and supervision.

pub mod bootstrap;
pub mod codec;
pub mod follow;
pub mod node;
pub mod peer;
pub mod progress;
pub mod shard;
pub mod supervisor;

pub use bootstrap::{copy_from, execute_plan};
pub use codec::{merge_values, partition_hash_of, StoredValue};
pub use follow::{apply_entry, apply_row, Applied, FollowSpec, Follower};
pub use node::StoreNode;
pub use peer::{
    BootstrapCopyRequest, BootstrapCopyResponse, CopyStream, LocalPeers, PeerConnector,
    PeerSource, TailRequest, TailResponse, TailStream,
};
pub use progress::{CursorKey, ProgressStore};
pub use shard::{Shard, BOOTSTRAP_COPY_BATCH_SIZE};
pub use supervisor::ShardSupervisor;
