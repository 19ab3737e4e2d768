//! Per-shard task supervision
//!
//! Every follow relationship of a shard runs as its own task under a child of
//! the shard's cancellation token, reconnecting forever with jittered
//! backoff. Transitional follows hang off a separate child token that is
//! cancelled at cutover.

use crate::common::{retry_forever, Error, FollowConfig, Result, METRICS};
use crate::store::bootstrap::execute_plan;
use crate::store::follow::{follow_name, FollowSpec, Follower};
use crate::store::peer::{PeerConnector, PeerSource};
use crate::store::shard::Shard;
use crate::topology::{
    peer_shards, shard_list_contains, BootstrapPlan, ClusterRing, ClusterShard, ShardInfo,
    ShardStatus,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct RunningFollow {
    cluster_size: u32,
    cancel: CancellationToken,
}

pub struct ShardSupervisor {
    shard: Arc<Shard>,
    follower: Arc<Follower>,
    peers: Arc<dyn PeerConnector>,
    ring: Arc<ClusterRing>,
    config: FollowConfig,
    cancel: CancellationToken,
    follows: Mutex<HashMap<ClusterShard, RunningFollow>>,
    transitional: Mutex<Option<CancellationToken>>,
    candidate: AtomicBool,
}

impl ShardSupervisor {
    pub fn new(
        shard: Arc<Shard>,
        ring: Arc<ClusterRing>,
        peers: Arc<dyn PeerConnector>,
        config: FollowConfig,
        candidate: bool,
    ) -> Self {
        Self {
            follower: Arc::new(Follower::new(shard.clone(), peers.clone(), config.clone())),
            shard,
            peers,
            ring,
            config,
            cancel: CancellationToken::new(),
            follows: Mutex::new(HashMap::new()),
            transitional: Mutex::new(None),
            candidate: AtomicBool::new(candidate),
        }
    }

    pub fn shard(&self) -> &Arc<Shard> {
        &self.shard
    }

    pub fn is_candidate(&self) -> bool {
        self.candidate.load(Ordering::Acquire)
    }

    /// Steady-state sources currently followed
    pub fn following(&self) -> Vec<ClusterShard> {
        let mut shards: Vec<ClusterShard> = self.follows.lock().keys().copied().collect();
        shards.sort();
        shards
    }

    pub fn is_following_transitionally(&self) -> bool {
        self.transitional.lock().is_some()
    }

    /// Bootstrap per `plan`, start following, then mark the shard READY.
    ///
    /// Bootstrap failures are retried until the shard is shut down.
    pub async fn start(&self, plan: &BootstrapPlan) -> Result<()> {
        self.shard.log().spawn_sync_task(self.cancel.child_token());
        self.bootstrap(plan, &self.cancel).await?;

        self.adjust_followings(plan.to_cluster_size, self.shard.replication_factor());
        if !plan.transitional_follow_source.is_empty() {
            let token = self.begin_transition();
            self.follow_transitionally(plan, &token);
        }

        self.shard.set_status(ShardStatus::Ready);
        Ok(())
    }

    /// Take in the data a resize moves onto this existing replica: copy from
    /// the plan's sources, then tail them until the shard is resized.
    pub async fn transition(&self, plan: &BootstrapPlan) -> Result<()> {
        let token = self.begin_transition();
        self.bootstrap(plan, &token).await?;
        self.follow_transitionally(plan, &token);
        info!("{} caught up for cluster size {}", self.shard, plan.to_cluster_size);
        Ok(())
    }

    fn begin_transition(&self) -> CancellationToken {
        let token = self.cancel.child_token();
        if let Some(previous) = self.transitional.lock().replace(token.clone()) {
            previous.cancel();
        }
        token
    }

    fn follow_transitionally(&self, plan: &BootstrapPlan, token: &CancellationToken) {
        for source in &plan.transitional_follow_source {
            info!("{} follows {} until cutover", self.shard, source);
            self.spawn_follow(
                *source,
                plan.from_cluster_size,
                plan.to_cluster_size,
                token.clone(),
            );
        }
    }

    async fn bootstrap(&self, plan: &BootstrapPlan, cancel: &CancellationToken) -> Result<()> {
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Shutdown(format!("shard {}", self.shard)))
                }
                outcome = execute_plan(&self.shard, self.peers.as_ref(), &self.ring, plan) => outcome,
            };
            match outcome {
                Ok(()) => return Ok(()),
                Err(e) if e.is_shutdown() => return Err(e),
                Err(e) if e.is_retryable() => {
                    info!("{} bootstrap source unavailable, retrying: {}", self.shard, e)
                }
                Err(e) => warn!("{} bootstrap failed, retrying: {}", self.shard, e),
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Shutdown(format!("shard {}", self.shard)))
                }
                _ = tokio::time::sleep(self.config.retry_interval()) => {}
            }
        }
    }

    /// Follow exactly the peers of this shard in a ring of `cluster_size`
    pub fn adjust_followings(&self, cluster_size: u32, replication_factor: u32) {
        let wanted = peer_shards(
            self.shard.server_id(),
            self.shard.shard_id(),
            cluster_size,
            replication_factor,
        );

        let mut follows = self.follows.lock();
        follows.retain(|source, running| {
            let keep = shard_list_contains(&wanted, source) && running.cluster_size == cluster_size;
            if !keep {
                info!("{} stops following {}", self.shard, source);
                running.cancel.cancel();
            }
            keep
        });

        for source in wanted {
            if follows.contains_key(&source) {
                continue;
            }
            let cancel = self.cancel.child_token();
            self.spawn_follow(source, cluster_size, cluster_size, cancel.clone());
            follows.insert(
                source,
                RunningFollow {
                    cluster_size,
                    cancel,
                },
            );
        }
    }

    fn spawn_follow(
        &self,
        source: ClusterShard,
        source_cluster_size: u32,
        target_cluster_size: u32,
        cancel: CancellationToken,
    ) {
        let follower = self.follower.clone();
        let ring = self.ring.clone();
        let interval = self.config.retry_interval();
        let name = follow_name(&self.shard, &source);

        tokio::spawn(async move {
            METRICS.active_followers.inc();
            retry_forever(&name, &cancel, interval, || {
                let follower = follower.clone();
                let ring = ring.clone();
                let cancel = cancel.clone();
                async move {
                    let peer = PeerSource::resolve(&ring, source)?;
                    let spec = FollowSpec::new(peer, source_cluster_size, target_cluster_size);
                    follower.follow(&spec, &cancel).await
                }
            })
            .await;
            METRICS.active_followers.dec();
            METRICS.remove_follow(&name);
        });
    }

    /// The candidate became authoritative: stop transitional follows and
    /// follow the peers of the promoted ring.
    pub fn cutover(&self, info: &ShardInfo) {
        self.candidate.store(false, Ordering::Release);
        self.resize(info.cluster_size, info.replication_factor);
        info!("{} cut over to cluster size {}", self.shard, info.cluster_size);
    }

    /// The shard now lives in a ring of `cluster_size`; any transition into
    /// that ring is over.
    pub fn resize(&self, cluster_size: u32, replication_factor: u32) {
        if let Some(token) = self.transitional.lock().take() {
            token.cancel();
        }
        self.shard.set_cluster_size(cluster_size, replication_factor);
        self.adjust_followings(cluster_size, replication_factor);
    }

    /// Cancel every task of this shard and close its log and engine
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.follows.lock().clear();
        self.transitional.lock().take();
        self.shard.set_status(ShardStatus::Deleted);
        self.shard.shutdown();
    }
}

impl Drop for ShardSupervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
