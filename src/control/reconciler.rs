//! Volume Reconciler
//!
//! The background task that converges observed state onto volume specs.
//! A periodic pass walks every volume; node liveness events preempt the
//! timer so fallout lands immediately instead of waiting a full period.
//! Every pass over one volume runs under that volume's lock, the same
//! lock the API takes, so convergence never races a spec change.
//!
//! Per-pass order for one volume: finish deletions, evict children faulted
//! beyond the grace period, top replicas up, trim excess, then flag paths
//! stuck connecting.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bounded;
use super::nexus::NexusManager;
use super::replicas::ReplicaManager;
use super::volumes::VolumeService;
use crate::config::ControlPlaneConfig;
use crate::engine::IoEngineRef;
use crate::error::{Error, ErrorAction, Result};
use crate::registry::{Registry, RegistryEvent};
use crate::resources::{
    ChildState, NodeId, PathState, PoolStatus, ReplicaId, VolumeId, VolumeSpec,
};

/// Background convergence task
pub struct VolumeReconciler {
    registry: Arc<Registry>,
    engine: IoEngineRef,
    replicas: Arc<ReplicaManager>,
    nexuses: Arc<NexusManager>,
    volumes: Arc<VolumeService>,
    config: ControlPlaneConfig,
}

impl VolumeReconciler {
    pub fn new(
        registry: Arc<Registry>,
        engine: IoEngineRef,
        replicas: Arc<ReplicaManager>,
        nexuses: Arc<NexusManager>,
        volumes: Arc<VolumeService>,
        config: ControlPlaneConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            engine,
            replicas,
            nexuses,
            volumes,
            config,
        })
    }

    /// Spawn the reconcile loop
    ///
    /// Ticks every `reconcile_period`; node liveness events are handled as
    /// they arrive. A lagged event stream forces a full pass, which covers
    /// whatever was missed.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let reconciler = Arc::clone(self);
        // subscribe before spawning so no event between spawn and first poll
        // of the task is lost
        let mut events = self.registry.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reconciler.config.reconcile_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Reconciler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        reconciler.reconcile_all().await;
                    }
                    event = events.recv() => match event {
                        Ok(RegistryEvent::NodeWentOffline { node_id }) => {
                            reconciler.handle_node_offline(&node_id).await;
                        }
                        Ok(RegistryEvent::NodeCameOnline { node_id }) => {
                            reconciler.handle_node_online(&node_id).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Event stream lagged, forcing a full pass");
                            reconciler.reconcile_all().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    /// One pass over every volume, plus node-level garbage collection
    pub async fn reconcile_all(&self) {
        let volumes = self.registry.resources.volume_ids();
        let passes = volumes.iter().map(|v| self.reconcile_volume(v));
        futures::future::join_all(passes).await;

        for node in self.registry.nodes.online_node_ids() {
            self.replicas.collect_disowned_on(&node).await;
        }
    }

    /// Converge one volume under its lock
    pub async fn reconcile_volume(&self, volume: &VolumeId) {
        let lock = self.registry.resources.volume_lock(volume);
        let _guard = lock.lock().await;
        let Some(spec) = self.registry.resources.get_volume_spec(volume) else {
            return;
        };

        if spec.deleting {
            if let Err(err) = self.volumes.teardown(&spec).await {
                self.log_requeue(volume, "teardown", &err);
            } else {
                info!(volume = %volume, "Deletion finished by reconciler");
            }
            return;
        }

        match self.converge(&spec).await {
            Ok(None) => self.registry.resources.clear_shortfall(volume),
            Ok(Some(note)) => self.registry.resources.set_shortfall(volume, note),
            Err(err) => {
                self.registry.resources.set_shortfall(volume, err.to_string());
                self.log_requeue(volume, "convergence", &err);
            }
        }
    }

    // =========================================================================
    // Liveness fallout
    // =========================================================================

    /// Apply a node loss: pools become Unknown, the node's nexus children
    /// go Faulted (starting their grace clocks), and its paths go Lost
    async fn handle_node_offline(&self, node: &NodeId) {
        info!(node = %node, "Node went offline, applying liveness fallout");
        self.registry
            .resources
            .set_node_pools_status(node, PoolStatus::Unknown);

        for volume in self.registry.resources.volume_ids() {
            let lock = self.registry.resources.volume_lock(&volume);
            let _guard = lock.lock().await;
            self.nexuses.fault_children_on_node(&volume, node);
            for path in self.registry.resources.paths_of(&volume) {
                if &path.node == node && path.state != PathState::Lost {
                    let _ = self
                        .registry
                        .resources
                        .set_path_state(&path.nexus, PathState::Lost);
                }
            }
        }
    }

    /// A returning node gets its pools back and its leftovers collected
    async fn handle_node_online(&self, node: &NodeId) {
        info!(node = %node, "Node came online, collecting leftovers");
        self.registry
            .resources
            .set_node_pools_status(node, PoolStatus::Online);
        self.replicas.collect_disowned_on(node).await;
        self.collect_orphan_nexuses(node).await;
    }

    /// Destroy engine nexuses that have no registry record
    ///
    /// These are left behind by forced destroys against a dead node.
    async fn collect_orphan_nexuses(&self, node: &NodeId) {
        let state = match bounded(
            node,
            self.config.node_conn_timeout,
            self.engine.node_state(node),
        )
        .await
        {
            Ok(state) => state,
            Err(err) => {
                debug!(node = %node, error = %err, "Orphan sweep skipped");
                return;
            }
        };
        for nexus in state.nexuses {
            if self.registry.resources.get_nexus(&nexus.id).is_none() {
                warn!(node = %node, nexus = %nexus.id, "Destroying orphaned engine nexus");
                if let Err(err) = bounded(
                    node,
                    self.config.node_conn_timeout,
                    self.engine.destroy_nexus(node, &nexus.id),
                )
                .await
                {
                    debug!(node = %node, nexus = %nexus.id, error = %err, "Orphan destroy failed");
                }
            }
        }
    }

    // =========================================================================
    // Convergence
    // =========================================================================

    /// Drive one volume toward its spec
    ///
    /// `Ok(None)` means converged; `Ok(Some(note))` converged except for a
    /// standing condition worth surfacing (a stuck path).
    async fn converge(&self, spec: &VolumeSpec) -> Result<Option<String>> {
        if spec.is_published() {
            self.converge_published(spec).await?;
        } else {
            self.converge_unpublished(spec).await?;
        }
        Ok(self.flag_stuck_paths(&spec.uuid))
    }

    async fn converge_published(&self, spec: &VolumeSpec) -> Result<()> {
        let Some(nexus) = self.registry.resources.target_nexus_of(&spec.uuid) else {
            warn!(volume = %spec.uuid, "Published volume has no target nexus record");
            return Ok(());
        };
        if !self.registry.nodes.is_online(&nexus.node) {
            // target unobservable; nothing safe to converge from here
            return Ok(());
        }
        let desired = spec.num_replicas as usize;

        // evict children faulted beyond the grace period
        if spec.policy.self_heal {
            let now = Utc::now();
            for child in nexus.children.clone() {
                if child.state != ChildState::Faulted {
                    continue;
                }
                let Some(faulted_at) = child.faulted_at else {
                    continue;
                };
                let waited = now
                    .signed_duration_since(faulted_at)
                    .to_std()
                    .unwrap_or_default();
                if waited < self.config.faulted_child_wait_period {
                    continue;
                }
                let Some(current) = self.registry.resources.get_nexus(&nexus.id) else {
                    return Ok(());
                };
                if current.children.len() <= 1 {
                    warn!(volume = %spec.uuid, "Refusing to evict the only child");
                    break;
                }
                info!(
                    volume = %spec.uuid,
                    replica = %child.replica,
                    "Evicting child faulted beyond the grace period"
                );
                self.nexuses.detach_child(&current, &child.replica).await?;
                if let Some(replica) = self.registry.resources.get_replica(&child.replica) {
                    self.replicas.destroy(&replica).await?;
                }
            }
        }

        // top up to the desired child count
        let Some(nexus) = self.registry.resources.get_nexus(&nexus.id) else {
            return Ok(());
        };
        let mut have = nexus.children.len();
        if have < desired {
            // reattach owned replicas that fell out of the child set first
            let attached: HashSet<ReplicaId> = nexus.children.iter().map(|c| c.replica).collect();
            for replica in self.registry.resources.replicas_of(&spec.uuid) {
                if have >= desired {
                    break;
                }
                if attached.contains(&replica.id)
                    || !self.registry.nodes.is_online(&replica.node)
                {
                    continue;
                }
                self.nexuses.attach_replica(&nexus, &replica).await?;
                have += 1;
            }
            if have < desired {
                let new = self.replicas.create_replicas(spec, desired - have).await?;
                for replica in &new {
                    self.nexuses.attach_replica(&nexus, replica).await?;
                }
            }
        }

        // trim down to the desired child count
        let Some(nexus) = self.registry.resources.get_nexus(&nexus.id) else {
            return Ok(());
        };
        if nexus.children.len() > desired {
            let excess = nexus.children.len() - desired;
            let mut victims = nexus.children.clone();
            victims.sort_by_key(|c| (health_rank(c.state), self.replica_created(&c.replica)));
            let mut removed = 0;
            for victim in victims {
                if removed >= excess {
                    break;
                }
                let Some(current) = self.registry.resources.get_nexus(&nexus.id) else {
                    break;
                };
                if victim.state == ChildState::Online && current.online_children() <= 1 {
                    warn!(volume = %spec.uuid, "Keeping the last online child");
                    continue;
                }
                self.nexuses.detach_child(&current, &victim.replica).await?;
                if let Some(replica) = self.registry.resources.get_replica(&victim.replica) {
                    self.replicas.destroy(&replica).await?;
                }
                removed += 1;
            }
        }
        Ok(())
    }

    async fn converge_unpublished(&self, spec: &VolumeSpec) -> Result<()> {
        let desired = spec.num_replicas as usize;
        let owned = self.registry.resources.replicas_of(&spec.uuid);
        let healthy = owned
            .iter()
            .filter(|r| self.registry.nodes.is_online(&r.node))
            .count();

        if healthy < desired {
            self.replicas
                .create_replicas(spec, desired - healthy)
                .await?;
        }

        let owned = self.registry.resources.replicas_of(&spec.uuid);
        if owned.len() > desired {
            let excess = owned.len() - desired;
            let mut healthy_left = owned
                .iter()
                .filter(|r| self.registry.nodes.is_online(&r.node))
                .count();
            let mut victims = owned;
            victims.sort_by_key(|r| {
                (
                    self.registry.nodes.is_online(&r.node),
                    r.created_at,
                    r.id,
                )
            });
            let mut removed = 0;
            for victim in victims {
                if removed >= excess {
                    break;
                }
                let victim_healthy = self.registry.nodes.is_online(&victim.node);
                if victim_healthy && healthy_left <= 1 {
                    warn!(volume = %spec.uuid, "Keeping the last healthy replica");
                    continue;
                }
                self.replicas.destroy(&victim).await?;
                if victim_healthy {
                    healthy_left -= 1;
                }
                removed += 1;
            }
        }
        Ok(())
    }

    /// A path still Connecting past the timeout is surfaced on the volume
    fn flag_stuck_paths(&self, volume: &VolumeId) -> Option<String> {
        let now = Utc::now();
        for path in self.registry.resources.paths_of(volume) {
            if path.state != PathState::Connecting {
                continue;
            }
            let waited = now
                .signed_duration_since(path.created_at)
                .to_std()
                .unwrap_or_default();
            if waited > self.config.path_connect_timeout {
                let err = Error::PathTimeout {
                    volume: volume.to_string(),
                    node: path.node.to_string(),
                    waited_ms: waited.as_millis() as u64,
                };
                warn!(volume = %volume, node = %path.node, "Path stuck in connecting");
                return Some(err.to_string());
            }
        }
        None
    }

    fn replica_created(&self, replica: &ReplicaId) -> DateTime<Utc> {
        self.registry
            .resources
            .get_replica(replica)
            .map(|r| r.created_at)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn log_requeue(&self, volume: &VolumeId, stage: &str, err: &Error) {
        match err.action() {
            ErrorAction::NoRequeue => {
                error!(volume = %volume, stage, error = %err, "Reconcile failed permanently");
            }
            ErrorAction::RequeueAfter(delay) => {
                warn!(volume = %volume, stage, retry_in = ?delay, error = %err, "Reconcile deferred");
            }
            ErrorAction::RequeueWithBackoff => {
                warn!(volume = %volume, stage, error = %err, "Reconcile will retry");
            }
        }
    }
}

fn health_rank(state: ChildState) -> u8 {
    match state {
        ChildState::Faulted => 0,
        ChildState::Degraded => 1,
        ChildState::Online => 2,
    }
}
