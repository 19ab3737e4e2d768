pub mod bootstrap;
pub mod events;
pub mod node;
pub mod registry;
pub mod residency;
pub mod ring;

pub use bootstrap::{plan_with_topo_change, BootstrapPlan, BootstrapRequest};
pub use events::{EventBus, ShardEvent, TopologyEvent};
pub use node::{Node, ShardInfo, ShardStatus, StoreResource};
pub use registry::{KeyspaceLocks, PlannedShard, TopologyRegistry};
pub use residency::{
    is_shard_local, local_shards, partition_shards, peer_shards, shard_list_contains, ClusterShard,
};
pub use ring::{AccessOption, ClusterNode, ClusterRing, Ring, Topology};
