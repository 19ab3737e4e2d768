//! Keyspace registry and control-plane operations
//!
//! Owns every cluster ring, keyed by keyspace then data center. Control-plane
//! operations on one keyspace are serialized by a per-keyspace async lock and
//! validate all preconditions before touching a ring.

use crate::common::{Error, Result};
use crate::topology::events::{EventBus, ShardEvent, TopologyEvent};
use crate::topology::node::{ShardInfo, StoreResource};
use crate::topology::residency::{is_shard_local, local_shards};
use crate::topology::ring::{validate_size, ClusterRing};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

type LockTable = Mutex<HashMap<String, (Arc<tokio::sync::Mutex<()>>, usize)>>;

/// Async mutex per keyspace; an entry lives only while someone holds or waits on it
#[derive(Debug, Clone, Default)]
pub struct KeyspaceLocks {
    table: Arc<LockTable>,
}

impl KeyspaceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, keyspace: &str) -> KeyspaceGuard {
        let mutex = {
            let mut table = self.table.lock();
            let entry = table
                .entry(keyspace.to_string())
                .or_insert_with(|| (Arc::new(tokio::sync::Mutex::new(())), 0));
            entry.1 += 1;
            entry.0.clone()
        };
        let guard = mutex.lock_owned().await;
        KeyspaceGuard {
            guard: Some(guard),
            keyspace: keyspace.to_string(),
            table: self.table.clone(),
        }
    }

    /// Keyspaces with a holder or waiter
    pub fn active(&self) -> usize {
        self.table.lock().len()
    }
}

pub struct KeyspaceGuard {
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
    keyspace: String,
    table: Arc<LockTable>,
}

impl Drop for KeyspaceGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut table = self.table.lock();
        if let Some(entry) = table.get_mut(&self.keyspace) {
            entry.1 -= 1;
            if entry.1 == 0 {
                table.remove(&self.keyspace);
            }
        }
    }
}

/// A shard replica planned by a resize or replacement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedShard {
    pub store: StoreResource,
    pub info: ShardInfo,
}

#[derive(Debug, Default)]
pub struct TopologyRegistry {
    keyspaces: RwLock<HashMap<String, HashMap<String, Arc<ClusterRing>>>>,
    locks: KeyspaceLocks,
    events: EventBus,
}

impl TopologyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn locks(&self) -> &KeyspaceLocks {
        &self.locks
    }

    pub fn cluster(&self, keyspace: &str, data_center: &str) -> Result<Arc<ClusterRing>> {
        self.keyspaces
            .read()
            .get(keyspace)
            .ok_or_else(|| Error::NotFound(format!("keyspace {}", keyspace)))?
            .get(data_center)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("keyspace {} in {}", keyspace, data_center)))
    }

    pub fn keyspaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.keyspaces.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Register a new cluster with server `i` on `stores[i]`
    pub async fn create_cluster(
        &self,
        keyspace: &str,
        data_center: &str,
        replication_factor: u32,
        stores: &[StoreResource],
    ) -> Result<Arc<ClusterRing>> {
        let _guard = self.locks.lock(keyspace).await;

        let size = stores.len() as u32;
        validate_size(size, replication_factor)?;
        if self.cluster(keyspace, data_center).is_ok() {
            return Err(Error::InvalidConfig(format!(
                "keyspace {} already exists in {}",
                keyspace, data_center
            )));
        }

        let ring = Arc::new(ClusterRing::new(keyspace, data_center, size, replication_factor)?);
        let mut created = Vec::new();
        for (server_id, store) in stores.iter().enumerate() {
            for shard in local_shards(server_id as u32, size, replication_factor) {
                let info = ShardInfo::new(keyspace, shard.server_id, shard.shard_id, size, replication_factor);
                ring.set_shard(store, info.clone())?;
                created.push(ShardEvent::Created {
                    store: store.clone(),
                    info,
                });
            }
        }

        self.keyspaces
            .write()
            .entry(keyspace.to_string())
            .or_default()
            .insert(data_center.to_string(), ring.clone());
        info!("created cluster {}", ring);
        for event in created {
            self.events.publish(event);
        }
        Ok(ring)
    }

    /// Drop a keyspace in every data center
    pub async fn delete_keyspace(&self, keyspace: &str) -> Result<()> {
        let _guard = self.locks.lock(keyspace).await;

        let clusters = self
            .keyspaces
            .write()
            .remove(keyspace)
            .ok_or_else(|| Error::NotFound(format!("keyspace {}", keyspace)))?;

        for ring in clusters.values() {
            let topology = ring.snapshot();
            let rings = std::iter::once(topology.current()).chain(topology.next());
            for placed in rings.flat_map(|r| r.all_shards()) {
                self.events.publish(ShardEvent::Removed {
                    store: placed.store.clone(),
                    info: placed.info.clone(),
                    store_removed: true,
                });
            }
        }
        info!("deleted keyspace {}", keyspace);
        Ok(())
    }

    /// Open a resize transition and plan its candidate replicas.
    ///
    /// Growing needs one new store per added server, in server id order.
    pub async fn resize_cluster(
        &self,
        keyspace: &str,
        data_center: &str,
        to_size: u32,
        new_stores: &[StoreResource],
    ) -> Result<Vec<PlannedShard>> {
        let _guard = self.locks.lock(keyspace).await;

        let ring = self.cluster(keyspace, data_center)?;
        ensure_stable(&ring)?;
        let from_size = ring.expected_size();
        let rf = ring.replication_factor();
        if from_size == to_size {
            return Err(Error::InvalidConfig(format!(
                "cluster {} is already size {}",
                keyspace, to_size
            )));
        }
        validate_size(to_size, rf)?;
        let added = to_size.saturating_sub(from_size) as usize;
        if new_stores.len() != added {
            return Err(Error::InvalidConfig(format!(
                "resize {} => {} needs {} new stores, got {}",
                from_size,
                to_size,
                added,
                new_stores.len()
            )));
        }

        let topology = ring.snapshot();
        let current = topology.current();
        let mut planned = Vec::new();
        for server_id in 0..to_size {
            let store = if server_id < from_size {
                match current.node_for_server(server_id) {
                    Some(node) => node.store,
                    None => {
                        return Err(Error::NotFound(format!(
                            "server {} of {}",
                            server_id, keyspace
                        )))
                    }
                }
            } else {
                new_stores[(server_id - from_size) as usize].clone()
            };
            for shard in local_shards(server_id, to_size, rf) {
                if current.replica(shard.shard_id, server_id).is_some() {
                    continue;
                }
                planned.push(PlannedShard {
                    store: store.clone(),
                    info: ShardInfo::new(keyspace, server_id, shard.shard_id, to_size, rf).candidate(),
                });
            }
        }

        ring.set_next_cluster(to_size, rf)?;
        for p in &planned {
            ring.set_shard(&p.store, p.info.clone())?;
            self.events.publish(ShardEvent::Created {
                store: p.store.clone(),
                info: p.info.clone(),
            });
        }
        self.events.publish(ShardEvent::Resized {
            keyspace: keyspace.to_string(),
            to_cluster_size: to_size,
            replication_factor: rf,
        });
        info!("resizing {}", ring);
        Ok(planned)
    }

    /// Open a replacement transition moving every replica of `server_id` to `new_store`
    pub async fn replace_node(
        &self,
        keyspace: &str,
        data_center: &str,
        server_id: u32,
        new_store: StoreResource,
    ) -> Result<Vec<PlannedShard>> {
        let _guard = self.locks.lock(keyspace).await;

        let ring = self.cluster(keyspace, data_center)?;
        ensure_stable(&ring)?;
        let size = ring.expected_size();
        let rf = ring.replication_factor();
        if server_id >= size {
            return Err(Error::InvalidConfig(format!(
                "server {} is outside cluster size {}",
                server_id, size
            )));
        }
        let old = ring
            .snapshot()
            .current()
            .node_for_server(server_id)
            .ok_or_else(|| Error::NotFound(format!("server {} of {}", server_id, keyspace)))?;
        if old.store.address == new_store.address {
            return Err(Error::InvalidConfig(format!(
                "server {} is already on {}",
                server_id, new_store.address
            )));
        }

        let planned: Vec<PlannedShard> = local_shards(server_id, size, rf)
            .into_iter()
            .map(|shard| PlannedShard {
                store: new_store.clone(),
                info: ShardInfo::new(keyspace, server_id, shard.shard_id, size, rf).candidate(),
            })
            .collect();

        ring.set_next_cluster(size, rf)?;
        for p in &planned {
            ring.set_shard(&p.store, p.info.clone())?;
            self.events.publish(ShardEvent::Created {
                store: p.store.clone(),
                info: p.info.clone(),
            });
        }
        info!("replacing server {} of {} with {}", server_id, ring, new_store.address);
        Ok(planned)
    }

    /// Promote every candidate, fix cluster sizes of surviving replicas and
    /// drop replicas that are no longer local in the new ring.
    pub async fn complete_transition(&self, keyspace: &str, data_center: &str) -> Result<()> {
        let _guard = self.locks.lock(keyspace).await;

        let ring = self.cluster(keyspace, data_center)?;
        let topology = ring.snapshot();
        let next = topology.next().ok_or_else(|| {
            Error::InvalidConfig(format!("cluster {} has no transition in progress", keyspace))
        })?;
        let to_size = next.expected_size();
        let rf = next.replication_factor();

        for candidate in next.all_shards() {
            let displaced = ring.promote_candidate(&candidate.info)?;
            let mut promoted = candidate.info.clone();
            promoted.is_candidate = false;
            self.events.publish(ShardEvent::Promoted { info: promoted });
            if let Some(old) = displaced {
                if old.store.address != candidate.store.address {
                    self.events.publish(ShardEvent::Removed {
                        store_removed: !ring.uses_store(&old.store.address),
                        store: old.store,
                        info: old.info,
                    });
                }
            }
        }
        ring.remove_next_cluster();

        for placed in ring.snapshot().current().all_shards() {
            let info = &placed.info;
            if is_shard_local(info.shard_id, info.server_id, to_size, rf) {
                if info.cluster_size != to_size {
                    let mut updated = info.clone();
                    updated.cluster_size = to_size;
                    if let Some(old) = ring.set_shard(&placed.store, updated.clone())? {
                        self.events.publish(ShardEvent::Updated {
                            store: placed.store.clone(),
                            info: updated,
                            old,
                        });
                    }
                }
            } else {
                let store_removed = ring.remove_shard(&placed.store, info);
                self.events.publish(ShardEvent::Removed {
                    store: placed.store.clone(),
                    info: info.clone(),
                    store_removed,
                });
            }
        }

        info!("completed transition {}", ring);
        Ok(())
    }

    /// Apply one event from the topology feed
    pub async fn apply(&self, event: TopologyEvent) -> Result<()> {
        let keyspace = event.keyspace().to_string();
        let _guard = self.locks.lock(&keyspace).await;

        match event {
            TopologyEvent::Create {
                data_center,
                store,
                info,
            }
            | TopologyEvent::Update {
                data_center,
                store,
                info,
            } => {
                let ring = self.ensure_cluster(&keyspace, &data_center, &info)?;
                match ring.set_shard(&store, info.clone())? {
                    None => self.events.publish(ShardEvent::Created { store, info }),
                    Some(old) => self.events.publish(ShardEvent::Updated { store, info, old }),
                }
            }
            TopologyEvent::Remove {
                data_center,
                store,
                info,
            } => {
                let ring = self.cluster(&keyspace, &data_center)?;
                let store_removed = ring.remove_shard(&store, &info);
                self.events.publish(ShardEvent::Removed {
                    store,
                    info,
                    store_removed,
                });
            }
            TopologyEvent::Resize {
                keyspace,
                data_center,
                to_cluster_size,
                replication_factor,
            } => {
                let ring = self.cluster(&keyspace, &data_center)?;
                ring.set_next_cluster(to_cluster_size, replication_factor)?;
                self.events.publish(ShardEvent::Resized {
                    keyspace,
                    to_cluster_size,
                    replication_factor,
                });
            }
            TopologyEvent::Promote { data_center, info } => {
                let ring = self.cluster(&keyspace, &data_center)?;
                ring.promote_candidate(&info)?;
                let mut promoted = info;
                promoted.is_candidate = false;
                self.events.publish(ShardEvent::Promoted { info: promoted });
            }
        }
        Ok(())
    }

    fn ensure_cluster(
        &self,
        keyspace: &str,
        data_center: &str,
        info: &ShardInfo,
    ) -> Result<Arc<ClusterRing>> {
        if let Ok(ring) = self.cluster(keyspace, data_center) {
            return Ok(ring);
        }
        let ring = Arc::new(ClusterRing::new(
            keyspace,
            data_center,
            info.cluster_size,
            info.replication_factor,
        )?);
        let mut keyspaces = self.keyspaces.write();
        let ring = keyspaces
            .entry(keyspace.to_string())
            .or_default()
            .entry(data_center.to_string())
            .or_insert(ring)
            .clone();
        Ok(ring)
    }
}

fn ensure_stable(ring: &ClusterRing) -> Result<()> {
    match ring.next_size() {
        Some(next) => Err(Error::InvalidConfig(format!(
            "cluster {} is changing {} => {} in progress",
            ring.keyspace(),
            ring.expected_size(),
            next
        ))),
        None => Ok(()),
    }
}
