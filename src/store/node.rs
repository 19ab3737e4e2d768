//! One store process
//!
//! Subscribes to the registry's shard events and reacts to the ones naming
//! its own address: opens and bootstraps new replicas, resizes and cuts over
//! existing ones, shuts down removed ones.

use crate::common::{LocalStore, Result, StoreConfig};
use crate::store::peer::{LocalPeers, PeerConnector};
use crate::store::shard::Shard;
use crate::store::supervisor::ShardSupervisor;
use crate::topology::{
    plan_with_topo_change, BootstrapPlan, BootstrapRequest, ShardEvent, ShardInfo, StoreResource,
    TopologyRegistry,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type ShardKey = (String, u32);

pub struct StoreNode {
    config: StoreConfig,
    data_center: String,
    resource: StoreResource,
    registry: Arc<TopologyRegistry>,
    peers: Arc<dyn PeerConnector>,
    local: Option<Arc<LocalPeers>>,
    shards: RwLock<HashMap<ShardKey, Arc<ShardSupervisor>>>,
}

impl StoreNode {
    pub fn new(
        config: StoreConfig,
        data_center: impl Into<String>,
        resource: StoreResource,
        registry: Arc<TopologyRegistry>,
        peers: Arc<dyn PeerConnector>,
    ) -> Self {
        Self {
            config,
            data_center: data_center.into(),
            resource,
            registry,
            peers,
            local: None,
            shards: RwLock::new(HashMap::new()),
        }
    }

    /// A node whose shards serve and reach peers through `peers`
    pub fn in_process(
        config: StoreConfig,
        data_center: impl Into<String>,
        resource: StoreResource,
        registry: Arc<TopologyRegistry>,
        peers: Arc<LocalPeers>,
    ) -> Self {
        let mut node = Self::new(config, data_center, resource, registry, peers.clone());
        node.local = Some(peers);
        node
    }

    pub fn resource(&self) -> &StoreResource {
        &self.resource
    }

    pub fn shard(&self, keyspace: &str, shard_id: u32) -> Option<Arc<Shard>> {
        self.supervisor(keyspace, shard_id).map(|s| s.shard().clone())
    }

    pub fn supervisor(&self, keyspace: &str, shard_id: u32) -> Option<Arc<ShardSupervisor>> {
        self.shards
            .read()
            .get(&(keyspace.to_string(), shard_id))
            .cloned()
    }

    /// Hosted shard ids of `keyspace`, sorted
    pub fn shard_ids(&self, keyspace: &str) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .shards
            .read()
            .keys()
            .filter(|(ks, _)| ks == keyspace)
            .map(|(_, id)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Handle registry events until `cancel` fires.
    ///
    /// Subscribes before returning, so no event published after this call
    /// is missed.
    pub fn run(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut events = self.registry.events().subscribe();
        let node = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if let Err(e) = node.handle(event).await {
                    warn!("store {} failed to handle event: {}", node.resource.address, e);
                }
            }
            node.shutdown();
        })
    }

    fn is_mine(&self, store: &StoreResource) -> bool {
        store.address == self.resource.address
    }

    pub async fn handle(&self, event: ShardEvent) -> Result<()> {
        match event {
            ShardEvent::Created { store, info } if self.is_mine(&store) => self.open_shard(info),
            ShardEvent::Updated { store, info, old } if self.is_mine(&store) => {
                if let Some(supervisor) = self.supervisor(&info.keyspace, info.shard_id) {
                    if info.cluster_size != old.cluster_size
                        || info.replication_factor != old.replication_factor
                    {
                        supervisor.resize(info.cluster_size, info.replication_factor);
                    }
                }
                Ok(())
            }
            ShardEvent::Removed { store, info, .. } if self.is_mine(&store) => {
                self.drop_shard(&info);
                Ok(())
            }
            ShardEvent::Promoted { info } => {
                match self.supervisor(&info.keyspace, info.shard_id) {
                    Some(s) if s.is_candidate() && s.shard().server_id() == info.server_id => {
                        s.cutover(&info)
                    }
                    _ => {}
                }
                Ok(())
            }
            ShardEvent::Resized {
                keyspace,
                to_cluster_size,
                replication_factor,
            } => self.begin_resize(&keyspace, to_cluster_size, replication_factor),
            _ => Ok(()),
        }
    }

    fn open_engine(&self, info: &ShardInfo) -> Result<Arc<dyn LocalStore>> {
        #[cfg(feature = "rocksdb")]
        {
            let dir = self.config.shard_data_dir(&info.keyspace, info.shard_id);
            Ok(Arc::new(crate::common::storage::RocksStore::open(dir)?))
        }
        #[cfg(not(feature = "rocksdb"))]
        {
            let _ = info;
            Ok(Arc::new(crate::common::MemStore::new()))
        }
    }

    fn open_shard(&self, info: ShardInfo) -> Result<()> {
        let key = (info.keyspace.clone(), info.shard_id);
        if self.shards.read().contains_key(&key) {
            warn!("store {} already hosts {}", self.resource.address, info.identifier());
            return Ok(());
        }

        let ring = self.registry.cluster(&info.keyspace, &self.data_center)?;
        let shard = Arc::new(Shard::open(&self.config, &info, self.open_engine(&info)?)?);
        if let Some(local) = &self.local {
            local.register(&self.resource.admin_address, shard.clone());
        }

        let plan = if info.is_candidate {
            plan_with_topo_change(&BootstrapRequest {
                server_id: info.server_id,
                shard_id: info.shard_id,
                from_cluster_size: ring.expected_size(),
                to_cluster_size: info.cluster_size,
                replication_factor: info.replication_factor,
            })
        } else {
            // a replica that followed before can usually resume instead of copying
            let restarted = !shard.progress().list()?.is_empty();
            BootstrapPlan::normal_start(
                info.server_id,
                info.shard_id,
                info.cluster_size,
                info.replication_factor,
                restarted,
            )
        };

        let supervisor = Arc::new(ShardSupervisor::new(
            shard,
            ring,
            self.peers.clone(),
            self.config.follow.clone(),
            info.is_candidate,
        ));
        self.shards.write().insert(key, supervisor.clone());
        info!("store {} opened {} with plan {}", self.resource.address, info.identifier(), plan);

        tokio::spawn(async move {
            if let Err(e) = supervisor.start(&plan).await {
                warn!("shard {} did not start: {}", supervisor.shard(), e);
            }
        });
        Ok(())
    }

    /// Start the transitions hosted replicas need for a resize. Candidates
    /// planned their own when they were opened.
    fn begin_resize(&self, keyspace: &str, to_cluster_size: u32, replication_factor: u32) -> Result<()> {
        let supervisors: Vec<Arc<ShardSupervisor>> = self
            .shards
            .read()
            .iter()
            .filter(|((ks, _), s)| ks == keyspace && !s.is_candidate())
            .map(|(_, s)| s.clone())
            .collect();
        debug!(
            "store {}: {} resizing to {}, {} hosted replicas",
            self.resource.address,
            keyspace,
            to_cluster_size,
            supervisors.len()
        );

        for supervisor in supervisors {
            let shard = supervisor.shard();
            let plan = plan_with_topo_change(&BootstrapRequest {
                server_id: shard.server_id(),
                shard_id: shard.shard_id(),
                from_cluster_size: shard.cluster_size(),
                to_cluster_size,
                replication_factor,
            });
            if plan.is_empty() {
                continue;
            }
            info!("store {}: {} {}", self.resource.address, shard, plan);
            tokio::spawn(async move {
                if let Err(e) = supervisor.transition(&plan).await {
                    warn!("shard {} did not finish its transition: {}", supervisor.shard(), e);
                }
            });
        }
        Ok(())
    }

    fn drop_shard(&self, info: &ShardInfo) {
        let key = (info.keyspace.clone(), info.shard_id);
        let mut shards = self.shards.write();
        let Some(supervisor) = shards.get(&key) else {
            return;
        };
        if supervisor.shard().server_id() != info.server_id {
            return;
        }
        if let Some(supervisor) = shards.remove(&key) {
            drop(shards);
            if let Some(local) = &self.local {
                local.unregister(&self.resource.admin_address, &info.keyspace, info.shard_id);
            }
            supervisor.shutdown();
            info!("store {} dropped {}", self.resource.address, info.identifier());
        }
    }

    /// Shut down every hosted shard
    pub fn shutdown(&self) {
        let shards: Vec<(ShardKey, Arc<ShardSupervisor>)> = self.shards.write().drain().collect();
        for ((keyspace, shard_id), supervisor) in shards {
            if let Some(local) = &self.local {
                local.unregister(&self.resource.admin_address, &keyspace, shard_id);
            }
            supervisor.shutdown();
        }
    }
}
