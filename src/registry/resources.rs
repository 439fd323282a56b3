//! Resource Registry
//!
//! In-memory stores for pools, replicas, nexuses, volume specs and target
//! paths, plus the per-volume operation locks that serialize API mutations,
//! reconciler passes and liveness handling for one volume against each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::sync::Mutex;

use super::RegistryEvent;
use crate::error::{Error, Result};
use crate::resources::{
    Child, ChildState, Nexus, NexusId, NodeId, Path, PathState, Pool, PoolId, PoolStatus, Replica,
    ReplicaId, VolumeId, VolumeSpec,
};

// =============================================================================
// Statistics
// =============================================================================

/// Lifetime operation counters for the resource stores
#[derive(Debug, Default)]
pub struct ResourceStats {
    pub replicas_created: AtomicU64,
    pub replicas_destroyed: AtomicU64,
    pub nexuses_created: AtomicU64,
    pub nexuses_destroyed: AtomicU64,
    pub volumes_created: AtomicU64,
    pub volumes_destroyed: AtomicU64,
}

/// Snapshot of resource statistics plus current store sizes
#[derive(Debug, Clone)]
pub struct ResourceStatsSnapshot {
    pub pools: u64,
    pub replicas: u64,
    pub nexuses: u64,
    pub volumes: u64,
    pub paths: u64,
    pub replicas_created: u64,
    pub replicas_destroyed: u64,
    pub nexuses_created: u64,
    pub nexuses_destroyed: u64,
    pub volumes_created: u64,
    pub volumes_destroyed: u64,
}

// =============================================================================
// Resource Registry
// =============================================================================

/// Stores for everything the reconciler manages besides nodes
pub struct ResourceRegistry {
    pools: RwLock<HashMap<PoolId, Pool>>,
    replicas: RwLock<HashMap<ReplicaId, Replica>>,
    nexuses: RwLock<HashMap<NexusId, Nexus>>,
    volumes: RwLock<HashMap<VolumeId, VolumeSpec>>,
    /// One path per target nexus
    paths: RwLock<HashMap<NexusId, Path>>,
    /// Standing placement failures, retried every cycle
    shortfalls: RwLock<HashMap<VolumeId, String>>,
    /// Per-volume operation locks
    volume_locks: DashMap<VolumeId, Arc<Mutex<()>>>,
    stats: ResourceStats,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl ResourceRegistry {
    /// Create resource stores publishing on the given event bus
    pub fn new(event_sender: broadcast::Sender<RegistryEvent>) -> Arc<Self> {
        Arc::new(Self {
            pools: RwLock::new(HashMap::new()),
            replicas: RwLock::new(HashMap::new()),
            nexuses: RwLock::new(HashMap::new()),
            volumes: RwLock::new(HashMap::new()),
            paths: RwLock::new(HashMap::new()),
            shortfalls: RwLock::new(HashMap::new()),
            volume_locks: DashMap::new(),
            stats: ResourceStats::default(),
            event_sender,
        })
    }

    /// Get the operation lock for a volume
    ///
    /// Everyone touching one volume's spec or resources holds this across
    /// the whole operation, which is what serializes API calls, reconcile
    /// passes and liveness handling per volume.
    pub fn volume_lock(&self, volume: &VolumeId) -> Arc<Mutex<()>> {
        self.volume_locks
            .entry(*volume)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // =========================================================================
    // Pools
    // =========================================================================

    /// Insert a newly created pool
    pub fn insert_pool(&self, pool: Pool) -> Result<()> {
        let mut pools = self.pools.write();
        if pools.contains_key(&pool.id) {
            return Err(Error::AlreadyExists {
                kind: "pool".into(),
                id: pool.id.to_string(),
            });
        }
        let event = RegistryEvent::PoolCreated {
            pool_id: pool.id.clone(),
            node_id: pool.node.clone(),
            capacity_bytes: pool.capacity_bytes,
        };
        pools.insert(pool.id.clone(), pool);
        drop(pools);
        let _ = self.event_sender.send(event);
        Ok(())
    }

    /// Remove a pool record
    pub fn remove_pool(&self, pool_id: &PoolId) -> Result<Pool> {
        let removed = self.pools.write().remove(pool_id);
        match removed {
            Some(pool) => {
                let _ = self.event_sender.send(RegistryEvent::PoolDeleted {
                    pool_id: pool.id.clone(),
                    node_id: pool.node.clone(),
                });
                Ok(pool)
            }
            None => Err(Error::not_found("pool", pool_id)),
        }
    }

    pub fn get_pool(&self, pool_id: &PoolId) -> Option<Pool> {
        self.pools.read().get(pool_id).cloned()
    }

    pub fn list_pools(&self) -> Vec<Pool> {
        self.pools.read().values().cloned().collect()
    }

    pub fn pools_on_node(&self, node: &NodeId) -> Vec<Pool> {
        self.pools
            .read()
            .values()
            .filter(|p| &p.node == node)
            .cloned()
            .collect()
    }

    /// Refresh observed pool usage
    pub fn set_pool_usage(&self, pool_id: &PoolId, capacity_bytes: u64, used_bytes: u64) {
        if let Some(pool) = self.pools.write().get_mut(pool_id) {
            pool.capacity_bytes = capacity_bytes;
            pool.used_bytes = used_bytes;
            pool.status = PoolStatus::Online;
        }
    }

    /// Flip every pool on a node to the given status
    pub fn set_node_pools_status(&self, node: &NodeId, status: PoolStatus) {
        for pool in self.pools.write().values_mut() {
            if &pool.node == node {
                pool.status = status;
            }
        }
    }

    // =========================================================================
    // Replicas
    // =========================================================================

    /// Insert a newly created replica
    pub fn insert_replica(&self, replica: Replica) {
        let event = replica.owner.map(|volume| RegistryEvent::ReplicaCreated {
            replica: replica.id,
            volume,
            pool_id: replica.pool.clone(),
        });
        self.replicas.write().insert(replica.id, replica);
        self.stats.replicas_created.fetch_add(1, Ordering::Relaxed);
        if let Some(event) = event {
            let _ = self.event_sender.send(event);
        }
    }

    /// Remove a replica record
    pub fn remove_replica(&self, replica_id: &ReplicaId) -> Option<Replica> {
        let removed = self.replicas.write().remove(replica_id);
        if removed.is_some() {
            self.stats.replicas_destroyed.fetch_add(1, Ordering::Relaxed);
            let _ = self.event_sender.send(RegistryEvent::ReplicaDestroyed {
                replica: *replica_id,
            });
        }
        removed
    }

    pub fn get_replica(&self, replica_id: &ReplicaId) -> Option<Replica> {
        self.replicas.read().get(replica_id).cloned()
    }

    pub fn list_replicas(&self) -> Vec<Replica> {
        self.replicas.read().values().cloned().collect()
    }

    /// Replicas owned by a volume, oldest first
    pub fn replicas_of(&self, volume: &VolumeId) -> Vec<Replica> {
        let mut replicas: Vec<Replica> = self
            .replicas
            .read()
            .values()
            .filter(|r| r.is_owned_by(volume))
            .cloned()
            .collect();
        replicas.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        replicas
    }

    pub fn replicas_on_pool(&self, pool_id: &PoolId) -> Vec<Replica> {
        self.replicas
            .read()
            .values()
            .filter(|r| &r.pool == pool_id)
            .cloned()
            .collect()
    }

    /// Replicas without an owner, left behind by destroys on unreachable nodes
    pub fn disowned_replicas_on(&self, node: &NodeId) -> Vec<Replica> {
        self.replicas
            .read()
            .values()
            .filter(|r| r.owner.is_none() && &r.node == node)
            .cloned()
            .collect()
    }

    /// Detach a replica from its volume, leaving it for garbage collection
    pub fn disown_replica(&self, replica_id: &ReplicaId) -> Result<()> {
        let mut replicas = self.replicas.write();
        let replica = replicas
            .get_mut(replica_id)
            .ok_or_else(|| Error::not_found("replica", replica_id))?;
        replica.owner = None;
        Ok(())
    }

    // =========================================================================
    // Nexuses
    // =========================================================================

    /// Insert a newly created nexus
    pub fn insert_nexus(&self, nexus: Nexus) {
        self.nexuses.write().insert(nexus.id, nexus);
        self.stats.nexuses_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove a nexus record
    pub fn remove_nexus(&self, nexus_id: &NexusId) -> Option<Nexus> {
        let removed = self.nexuses.write().remove(nexus_id);
        if removed.is_some() {
            self.stats.nexuses_destroyed.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn get_nexus(&self, nexus_id: &NexusId) -> Option<Nexus> {
        self.nexuses.read().get(nexus_id).cloned()
    }

    pub fn list_nexuses(&self) -> Vec<Nexus> {
        self.nexuses.read().values().cloned().collect()
    }

    /// The active (non-shutdown) nexus of a volume, if any
    pub fn target_nexus_of(&self, volume: &VolumeId) -> Option<Nexus> {
        self.nexuses
            .read()
            .values()
            .find(|n| &n.volume == volume && !n.shutdown)
            .cloned()
    }

    /// Nexuses retired by republish, still awaiting destroy
    pub fn shutdown_nexuses_of(&self, volume: &VolumeId) -> Vec<Nexus> {
        self.nexuses
            .read()
            .values()
            .filter(|n| &n.volume == volume && n.shutdown)
            .cloned()
            .collect()
    }

    pub fn nexuses_of(&self, volume: &VolumeId) -> Vec<Nexus> {
        self.nexuses
            .read()
            .values()
            .filter(|n| &n.volume == volume)
            .cloned()
            .collect()
    }

    pub fn nexuses_on_node(&self, node: &NodeId) -> Vec<Nexus> {
        self.nexuses
            .read()
            .values()
            .filter(|n| &n.node == node)
            .cloned()
            .collect()
    }

    /// Mark a nexus retired
    pub fn set_nexus_shutdown(&self, nexus_id: &NexusId) -> Result<()> {
        let mut nexuses = self.nexuses.write();
        let nexus = nexuses
            .get_mut(nexus_id)
            .ok_or_else(|| Error::not_found("nexus", nexus_id))?;
        nexus.shutdown = true;
        Ok(())
    }

    /// Transition one child's health, emitting `ChildFaulted` on entry
    pub fn set_child_state(
        &self,
        nexus_id: &NexusId,
        replica: &ReplicaId,
        state: ChildState,
    ) -> Result<()> {
        let mut nexuses = self.nexuses.write();
        let nexus = nexuses
            .get_mut(nexus_id)
            .ok_or_else(|| Error::not_found("nexus", nexus_id))?;
        let volume = nexus.volume;
        let child = nexus
            .child_mut(replica)
            .ok_or_else(|| Error::not_found("child", replica))?;
        let newly_faulted = state == ChildState::Faulted && child.state != ChildState::Faulted;
        child.set_state(state, Utc::now());
        drop(nexuses);

        if newly_faulted {
            let _ = self.event_sender.send(RegistryEvent::ChildFaulted {
                nexus: *nexus_id,
                volume,
                replica: *replica,
            });
        }
        Ok(())
    }

    /// Attach a child to a nexus record
    pub fn add_nexus_child(&self, nexus_id: &NexusId, child: Child) -> Result<()> {
        let mut nexuses = self.nexuses.write();
        let nexus = nexuses
            .get_mut(nexus_id)
            .ok_or_else(|| Error::not_found("nexus", nexus_id))?;
        if nexus.child(&child.replica).is_some() {
            return Err(Error::AlreadyExists {
                kind: "child".into(),
                id: child.replica.to_string(),
            });
        }
        nexus.children.push(child);
        Ok(())
    }

    /// Detach a child from a nexus record
    pub fn remove_nexus_child(&self, nexus_id: &NexusId, replica: &ReplicaId) -> Result<()> {
        let mut nexuses = self.nexuses.write();
        let nexus = nexuses
            .get_mut(nexus_id)
            .ok_or_else(|| Error::not_found("nexus", nexus_id))?;
        let before = nexus.children.len();
        nexus.children.retain(|c| &c.replica != replica);
        if nexus.children.len() == before {
            return Err(Error::not_found("child", replica));
        }
        Ok(())
    }

    // =========================================================================
    // Volume specs
    // =========================================================================

    /// Insert a new volume spec
    pub fn insert_volume_spec(&self, spec: VolumeSpec) -> Result<()> {
        let mut volumes = self.volumes.write();
        if volumes.contains_key(&spec.uuid) {
            return Err(Error::AlreadyExists {
                kind: "volume".into(),
                id: spec.uuid.to_string(),
            });
        }
        let event = RegistryEvent::VolumeCreated {
            volume: spec.uuid,
            num_replicas: spec.num_replicas,
        };
        volumes.insert(spec.uuid, spec);
        drop(volumes);
        self.stats.volumes_created.fetch_add(1, Ordering::Relaxed);
        let _ = self.event_sender.send(event);
        Ok(())
    }

    /// Remove a volume spec and its operation lock
    pub fn remove_volume_spec(&self, volume: &VolumeId) -> Option<VolumeSpec> {
        let removed = self.volumes.write().remove(volume);
        if removed.is_some() {
            self.stats.volumes_destroyed.fetch_add(1, Ordering::Relaxed);
            self.shortfalls.write().remove(volume);
            self.volume_locks.remove(volume);
            let _ = self
                .event_sender
                .send(RegistryEvent::VolumeDeleted { volume: *volume });
        }
        removed
    }

    pub fn get_volume_spec(&self, volume: &VolumeId) -> Option<VolumeSpec> {
        self.volumes.read().get(volume).cloned()
    }

    pub fn list_volume_specs(&self) -> Vec<VolumeSpec> {
        self.volumes.read().values().cloned().collect()
    }

    pub fn volume_ids(&self) -> Vec<VolumeId> {
        self.volumes.read().keys().copied().collect()
    }

    /// Mutate a volume spec in place
    ///
    /// Target transitions observed across the mutation are published on the
    /// event bus.
    pub fn update_volume_spec<F>(&self, volume: &VolumeId, mutate: F) -> Result<VolumeSpec>
    where
        F: FnOnce(&mut VolumeSpec),
    {
        let mut volumes = self.volumes.write();
        let spec = volumes
            .get_mut(volume)
            .ok_or_else(|| Error::not_found("volume", volume))?;
        let previous_target = spec.target_config.clone();
        mutate(spec);
        let updated = spec.clone();
        drop(volumes);

        match (&previous_target, &updated.target_config) {
            (None, Some(target)) => {
                let _ = self.event_sender.send(RegistryEvent::TargetPublished {
                    volume: *volume,
                    node_id: target.node.clone(),
                    device_uri: target.device_uri.clone(),
                });
            }
            (Some(old), Some(new)) if old.nexus != new.nexus => {
                let _ = self.event_sender.send(RegistryEvent::TargetPublished {
                    volume: *volume,
                    node_id: new.node.clone(),
                    device_uri: new.device_uri.clone(),
                });
            }
            (Some(_), None) => {
                let _ = self
                    .event_sender
                    .send(RegistryEvent::TargetUnpublished { volume: *volume });
            }
            _ => {}
        }
        Ok(updated)
    }

    // =========================================================================
    // Paths
    // =========================================================================

    /// Record or replace the path for a nexus
    pub fn upsert_path(&self, path: Path) {
        let event = RegistryEvent::PathStateChanged {
            volume: path.volume,
            node_id: path.node.clone(),
            state: path.state,
        };
        self.paths.write().insert(path.nexus, path);
        let _ = self.event_sender.send(event);
    }

    /// Transition a path's host-side state
    ///
    /// Returns the previous state.
    pub fn set_path_state(&self, nexus_id: &NexusId, state: PathState) -> Result<PathState> {
        let mut paths = self.paths.write();
        let path = paths
            .get_mut(nexus_id)
            .ok_or_else(|| Error::not_found("path", nexus_id))?;
        let previous = path.state;
        path.state = state;
        let event = RegistryEvent::PathStateChanged {
            volume: path.volume,
            node_id: path.node.clone(),
            state,
        };
        drop(paths);
        if previous != state {
            let _ = self.event_sender.send(event);
        }
        Ok(previous)
    }

    pub fn remove_path(&self, nexus_id: &NexusId) -> Option<Path> {
        self.paths.write().remove(nexus_id)
    }

    pub fn get_path(&self, nexus_id: &NexusId) -> Option<Path> {
        self.paths.read().get(nexus_id).cloned()
    }

    /// All paths of a volume, oldest first
    pub fn paths_of(&self, volume: &VolumeId) -> Vec<Path> {
        let mut paths: Vec<Path> = self
            .paths
            .read()
            .values()
            .filter(|p| &p.volume == volume)
            .cloned()
            .collect();
        paths.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        paths
    }

    pub fn list_paths(&self) -> Vec<Path> {
        self.paths.read().values().cloned().collect()
    }

    // =========================================================================
    // Shortfalls
    // =========================================================================

    /// Record a standing placement failure for a volume
    pub fn set_shortfall(&self, volume: &VolumeId, reason: impl Into<String>) {
        self.shortfalls.write().insert(*volume, reason.into());
    }

    pub fn clear_shortfall(&self, volume: &VolumeId) {
        self.shortfalls.write().remove(volume);
    }

    pub fn get_shortfall(&self, volume: &VolumeId) -> Option<String> {
        self.shortfalls.read().get(volume).cloned()
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    pub fn stats(&self) -> ResourceStatsSnapshot {
        ResourceStatsSnapshot {
            pools: self.pools.read().len() as u64,
            replicas: self.replicas.read().len() as u64,
            nexuses: self.nexuses.read().len() as u64,
            volumes: self.volumes.read().len() as u64,
            paths: self.paths.read().len() as u64,
            replicas_created: self.stats.replicas_created.load(Ordering::Relaxed),
            replicas_destroyed: self.stats.replicas_destroyed.load(Ordering::Relaxed),
            nexuses_created: self.stats.nexuses_created.load(Ordering::Relaxed),
            nexuses_destroyed: self.stats.nexuses_destroyed.load(Ordering::Relaxed),
            volumes_created: self.stats.volumes_created.load(Ordering::Relaxed),
            volumes_destroyed: self.stats.volumes_destroyed.load(Ordering::Relaxed),
        }
    }
}
