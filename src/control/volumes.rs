//! Volume Service
//!
//! The synchronous face of volume management: spec creation and validation,
//! replica-count changes, publish and unpublish, and teardown. Every
//! operation runs under the volume's lock, the same lock reconcile passes
//! take, so spec changes and convergence never interleave within a volume.
//!
//! Creation places initial replicas synchronously; later changes only edit
//! the spec and leave convergence to the reconciler.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::nexus::NexusManager;
use super::publisher::TargetPublisher;
use super::replicas::ReplicaManager;
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::resources::{
    derive_status, ChildState, NodeId, Protocol, ReplicaTopology, Volume, VolumeId, VolumePolicy,
    VolumeSpec, VolumeState,
};

/// Volume-level API operations
pub struct VolumeService {
    registry: Arc<Registry>,
    replicas: Arc<ReplicaManager>,
    nexuses: Arc<NexusManager>,
    publisher: Arc<TargetPublisher>,
}

impl VolumeService {
    pub fn new(
        registry: Arc<Registry>,
        replicas: Arc<ReplicaManager>,
        nexuses: Arc<NexusManager>,
        publisher: Arc<TargetPublisher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            replicas,
            nexuses,
            publisher,
        })
    }

    /// Create a volume and place its initial replicas
    ///
    /// Placement is synchronous: when the cluster cannot host the requested
    /// replica count the spec is rolled back and the error returned, so a
    /// created volume always starts fully provisioned.
    pub async fn create_volume(
        &self,
        volume: VolumeId,
        size_bytes: u64,
        num_replicas: u8,
        thin: bool,
        policy: VolumePolicy,
    ) -> Result<Volume> {
        if size_bytes == 0 {
            return Err(Error::InvalidSpec {
                volume: volume.to_string(),
                reason: "size must be greater than zero".into(),
            });
        }
        if num_replicas == 0 {
            return Err(Error::InvalidSpec {
                volume: volume.to_string(),
                reason: "at least one replica is required".into(),
            });
        }

        let lock = self.registry.resources.volume_lock(&volume);
        let _guard = lock.lock().await;

        let spec = VolumeSpec {
            uuid: volume,
            size_bytes,
            num_replicas,
            thin,
            policy,
            target_config: None,
            deleting: false,
        };
        self.registry.resources.insert_volume_spec(spec.clone())?;

        if let Err(err) = self
            .replicas
            .create_replicas(&spec, num_replicas as usize)
            .await
        {
            warn!(volume = %volume, error = %err, "Initial placement failed, rolling back spec");
            self.registry.resources.remove_volume_spec(&volume);
            return Err(err);
        }

        info!(volume = %volume, replicas = num_replicas, size = size_bytes, "Volume created");
        Ok(self.compose(spec))
    }

    /// Fetch one volume, desired plus observed
    pub fn get_volume(&self, volume: &VolumeId) -> Result<Volume> {
        let spec = self
            .registry
            .resources
            .get_volume_spec(volume)
            .ok_or_else(|| Error::not_found("volume", volume))?;
        Ok(self.compose(spec))
    }

    /// All volumes, ordered by id
    pub fn list_volumes(&self) -> Vec<Volume> {
        let mut specs = self.registry.resources.list_volume_specs();
        specs.sort_by_key(|s| s.uuid);
        specs.into_iter().map(|s| self.compose(s)).collect()
    }

    /// Destroy a volume and everything it owns
    ///
    /// Garbage-collect semantics: the delete intent is flagged first, then
    /// nexuses and replicas are destroyed; unreachable nodes only disown,
    /// they never block the deletion.
    pub async fn destroy_volume(&self, volume: &VolumeId) -> Result<()> {
        let lock = self.registry.resources.volume_lock(volume);
        let _guard = lock.lock().await;

        if self.registry.resources.get_volume_spec(volume).is_none() {
            return Err(Error::not_found("volume", volume));
        }
        let spec = self
            .registry
            .resources
            .update_volume_spec(volume, |s| s.deleting = true)?;
        self.teardown(&spec).await?;
        info!(volume = %volume, "Volume destroyed");
        Ok(())
    }

    /// Tear down a deleting volume's resources and drop the spec
    ///
    /// Shared with the reconciler, which finishes deletions that arrived as
    /// zero-replica intent or were interrupted.
    pub(crate) async fn teardown(&self, spec: &VolumeSpec) -> Result<()> {
        for nexus in self.registry.resources.nexuses_of(&spec.uuid) {
            self.nexuses.destroy_nexus(&nexus, true).await?;
        }
        for replica in self.registry.resources.replicas_of(&spec.uuid) {
            self.replicas.destroy(&replica).await?;
        }
        self.registry.resources.remove_volume_spec(&spec.uuid);
        Ok(())
    }

    /// Change the desired replica count
    ///
    /// Zero is special: rejected while published, accepted as delete intent
    /// otherwise. Any other change lands in the spec synchronously and is
    /// converged by the reconciler.
    pub async fn set_replica_count(&self, volume: &VolumeId, count: u8) -> Result<Volume> {
        let lock = self.registry.resources.volume_lock(volume);
        let _guard = lock.lock().await;

        let spec = self
            .registry
            .resources
            .get_volume_spec(volume)
            .ok_or_else(|| Error::not_found("volume", volume))?;
        if spec.deleting {
            return Err(Error::VolumeDeleting {
                volume: volume.to_string(),
            });
        }

        if count == spec.num_replicas {
            return Ok(self.compose(spec));
        }

        if count == 0 {
            if spec.is_published() {
                return Err(Error::InvalidSpec {
                    volume: volume.to_string(),
                    reason: "cannot drop to zero replicas while published".into(),
                });
            }
            let updated = self
                .registry
                .resources
                .update_volume_spec(volume, |s| s.deleting = true)?;
            info!(volume = %volume, "Zero replicas requested, volume marked for deletion");
            return Ok(self.compose(updated));
        }

        let updated = self
            .registry
            .resources
            .update_volume_spec(volume, |s| s.num_replicas = count)?;
        info!(volume = %volume, from = spec.num_replicas, to = count, "Replica count changed");
        Ok(self.compose(updated))
    }

    /// Publish or, when asked and already published, republish the target
    pub async fn publish(
        &self,
        volume: &VolumeId,
        node: Option<NodeId>,
        protocol: Protocol,
        republish: bool,
        reuse_existing: bool,
    ) -> Result<Volume> {
        let lock = self.registry.resources.volume_lock(volume);
        let _guard = lock.lock().await;

        let spec = self
            .registry
            .resources
            .get_volume_spec(volume)
            .ok_or_else(|| Error::not_found("volume", volume))?;

        // Idempotent publish: hand back the standing target rather than fail
        // or rebuild, unless the caller named a different node or asked to
        // republish away from an unreachable or shutdown one
        if reuse_existing {
            if let Some(target) = &spec.target_config {
                let same_node = node.as_ref().map_or(true, |n| n == &target.node);
                let healthy = self.registry.nodes.is_online(&target.node)
                    && self
                        .registry
                        .resources
                        .get_nexus(&target.nexus)
                        .map_or(false, |n| !n.shutdown);
                if same_node && (healthy || !republish) {
                    debug!(volume = %volume, node = %target.node, "Reusing the published target");
                    return Ok(self.compose(spec));
                }
            }
        }

        let updated = if republish && spec.is_published() {
            self.publisher.republish(&spec).await?
        } else {
            self.publisher.publish(&spec, node, protocol).await?
        };
        Ok(self.compose(updated))
    }

    /// Unpublish the target
    pub async fn unpublish(&self, volume: &VolumeId, force: bool) -> Result<Volume> {
        let lock = self.registry.resources.volume_lock(volume);
        let _guard = lock.lock().await;

        let spec = self
            .registry
            .resources
            .get_volume_spec(volume)
            .ok_or_else(|| Error::not_found("volume", volume))?;
        let updated = self.publisher.unpublish(&spec, force).await?;
        Ok(self.compose(updated))
    }

    /// Destroy targets retired by earlier republishes
    pub async fn destroy_shutdown_targets(&self, volume: &VolumeId) -> Result<usize> {
        let lock = self.registry.resources.volume_lock(volume);
        let _guard = lock.lock().await;

        if self.registry.resources.get_volume_spec(volume).is_none() {
            return Err(Error::not_found("volume", volume));
        }
        self.publisher.destroy_shutdown_targets(volume).await
    }

    /// Assemble the observed state for a spec
    pub(crate) fn compose(&self, spec: VolumeSpec) -> Volume {
        let target_nexus = spec
            .target_config
            .as_ref()
            .and_then(|t| self.registry.resources.get_nexus(&t.nexus))
            .filter(|n| self.registry.nodes.is_online(&n.node));

        let mut topology = BTreeMap::new();
        for replica in self.registry.resources.replicas_of(&spec.uuid) {
            let state = match &target_nexus {
                Some(nexus) => nexus
                    .child(&replica.id)
                    .map(|c| c.state)
                    // created but not yet attached to the target
                    .unwrap_or(ChildState::Degraded),
                None => {
                    if self.registry.nodes.is_online(&replica.node) {
                        ChildState::Online
                    } else {
                        ChildState::Faulted
                    }
                }
            };
            topology.insert(
                replica.id,
                ReplicaTopology {
                    node: replica.node,
                    pool: replica.pool,
                    state,
                },
            );
        }

        let status = derive_status(&spec, target_nexus.as_ref(), &topology);
        let state = VolumeState {
            uuid: spec.uuid,
            status,
            size_bytes: spec.size_bytes,
            target: spec.target_config.clone(),
            replica_topology: topology,
            shortfall: self.registry.resources.get_shortfall(&spec.uuid),
        };
        Volume { spec, state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlPlaneConfig;
    use crate::engine::{InProcessEngine, IoEngineApi};
    use crate::resources::{PoolId, VolumeStatus};
    use assert_matches::assert_matches;
    use chrono::Utc;

    const MB: u64 = 1024 * 1024;

    struct Rig {
        registry: Arc<Registry>,
        engine: Arc<InProcessEngine>,
        volumes: Arc<VolumeService>,
    }

    async fn rig(nodes: &[(&str, &str)]) -> Rig {
        let registry = Registry::new();
        let engine = InProcessEngine::new();
        let config = ControlPlaneConfig::default();
        for (node, endpoint) in nodes {
            engine.add_node(*node, *endpoint);
            registry.nodes.register(*node, *endpoint).unwrap();
            let node_id = NodeId::from(*node);
            let pool_id = PoolId::from(format!("pool-{}", node));
            let state = engine
                .create_pool(&node_id, &pool_id, &["malloc:///disk0?size_mb=100".into()])
                .await
                .unwrap();
            registry
                .resources
                .insert_pool(crate::resources::Pool {
                    id: pool_id,
                    node: node_id,
                    disks: vec!["malloc:///disk0?size_mb=100".into()],
                    capacity_bytes: state.capacity_bytes,
                    used_bytes: state.used_bytes,
                    status: crate::resources::PoolStatus::Online,
                    created_at: Utc::now(),
                })
                .unwrap();
        }
        let replicas =
            ReplicaManager::new(registry.clone(), engine.clone(), config.node_conn_timeout);
        let nexuses = NexusManager::new(registry.clone(), engine.clone(), config.node_conn_timeout);
        let publisher = TargetPublisher::new(
            registry.clone(),
            engine.clone(),
            nexuses.clone(),
            config.node_conn_timeout,
        );
        let volumes = VolumeService::new(registry.clone(), replicas, nexuses, publisher);
        Rig {
            registry,
            engine,
            volumes,
        }
    }

    fn three_nodes() -> Vec<(&'static str, &'static str)> {
        vec![
            ("io-engine-1", "10.1.0.5:10124"),
            ("io-engine-2", "10.1.0.6:10124"),
            ("io-engine-3", "10.1.0.7:10124"),
        ]
    }

    #[tokio::test]
    async fn test_create_volume_places_synchronously() {
        let rig = rig(&three_nodes()).await;
        let id = VolumeId::new_random();
        let volume = rig
            .volumes
            .create_volume(id, 10 * MB, 3, false, VolumePolicy::default())
            .await
            .unwrap();

        assert_eq!(volume.state.status, VolumeStatus::Online);
        assert_eq!(volume.state.replica_topology.len(), 3);
        assert_eq!(rig.registry.resources.replicas_of(&id).len(), 3);
    }

    #[tokio::test]
    async fn test_create_volume_rolls_back_on_placement_failure() {
        let rig = rig(&three_nodes()).await;
        let id = VolumeId::new_random();
        // four replicas cannot land on three nodes
        let err = rig
            .volumes
            .create_volume(id, 10 * MB, 4, false, VolumePolicy::default())
            .await
            .unwrap_err();
        assert_matches!(err, Error::NoSuitablePool { .. });

        assert_matches!(
            rig.volumes.get_volume(&id).unwrap_err(),
            Error::NotFound { .. }
        );
        assert!(rig.registry.resources.list_replicas().is_empty());
    }

    #[tokio::test]
    async fn test_create_volume_validations() {
        let rig = rig(&three_nodes()).await;
        let err = rig
            .volumes
            .create_volume(VolumeId::new_random(), 0, 1, false, VolumePolicy::default())
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidSpec { .. });

        let err = rig
            .volumes
            .create_volume(
                VolumeId::new_random(),
                10 * MB,
                0,
                false,
                VolumePolicy::default(),
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidSpec { .. });
    }

    #[tokio::test]
    async fn test_set_replica_count_zero_rules() {
        let rig = rig(&three_nodes()).await;
        let id = VolumeId::new_random();
        rig.volumes
            .create_volume(id, 10 * MB, 2, false, VolumePolicy::default())
            .await
            .unwrap();

        // same count is an idempotent no-op
        let volume = rig.volumes.set_replica_count(&id, 2).await.unwrap();
        assert_eq!(volume.spec.num_replicas, 2);

        // zero while published is rejected synchronously
        rig.volumes
            .publish(&id, None, Protocol::Nvmf, false, false)
            .await
            .unwrap();
        let err = rig.volumes.set_replica_count(&id, 0).await.unwrap_err();
        assert_matches!(err, Error::InvalidSpec { .. });

        // zero while unpublished becomes delete intent
        rig.volumes.unpublish(&id, false).await.unwrap();
        let volume = rig.volumes.set_replica_count(&id, 0).await.unwrap();
        assert!(volume.spec.deleting);

        // a deleting volume rejects further changes
        let err = rig.volumes.set_replica_count(&id, 2).await.unwrap_err();
        assert_matches!(err, Error::VolumeDeleting { .. });
    }

    #[tokio::test]
    async fn test_destroy_volume_cleans_cluster() {
        let rig = rig(&three_nodes()).await;
        let id = VolumeId::new_random();
        rig.volumes
            .create_volume(id, 10 * MB, 2, false, VolumePolicy::default())
            .await
            .unwrap();
        rig.volumes
            .publish(&id, None, Protocol::Nvmf, false, false)
            .await
            .unwrap();

        rig.volumes.destroy_volume(&id).await.unwrap();

        assert_matches!(
            rig.volumes.get_volume(&id).unwrap_err(),
            Error::NotFound { .. }
        );
        assert!(rig.registry.resources.list_replicas().is_empty());
        assert!(rig.registry.resources.list_nexuses().is_empty());
        assert!(rig.registry.resources.list_paths().is_empty());
        for (node, _) in three_nodes() {
            let state = rig
                .engine
                .node_state(&NodeId::from(node))
                .await
                .unwrap();
            assert!(state.replicas.is_empty());
            assert!(state.nexuses.is_empty());
        }
    }

    #[tokio::test]
    async fn test_publish_republish_dispatch() {
        let rig = rig(&three_nodes()).await;
        let id = VolumeId::new_random();
        rig.volumes
            .create_volume(id, 10 * MB, 2, false, VolumePolicy::default())
            .await
            .unwrap();

        let published = rig
            .volumes
            .publish(&id, None, Protocol::Nvmf, false, false)
            .await
            .unwrap();
        let first = published.spec.target_config.unwrap();
        assert_eq!(published.state.status, VolumeStatus::Online);

        // a repeat publish conflicts, unless reuse_existing turns it into
        // an idempotent read of the standing target
        let err = rig
            .volumes
            .publish(&id, None, Protocol::Nvmf, false, false)
            .await
            .unwrap_err();
        assert_matches!(err, Error::AlreadyPublished { .. });
        let reused = rig
            .volumes
            .publish(&id, None, Protocol::Nvmf, false, true)
            .await
            .unwrap();
        assert_eq!(reused.spec.target_config.unwrap().nexus, first.nexus);

        // naming a different node keeps the conflict even with reuse
        let other = if first.node.as_str() == "io-engine-1" {
            "io-engine-2"
        } else {
            "io-engine-1"
        };
        let err = rig
            .volumes
            .publish(&id, Some(NodeId::from(other)), Protocol::Nvmf, false, true)
            .await
            .unwrap_err();
        assert_matches!(err, Error::AlreadyPublished { .. });

        // republish with reuse leaves a healthy target where it is
        let kept = rig
            .volumes
            .publish(&id, None, Protocol::Nvmf, true, true)
            .await
            .unwrap();
        assert_eq!(kept.spec.target_config.unwrap().nexus, first.nexus);

        // republish without reuse moves it off the incumbent node
        let moved = rig
            .volumes
            .publish(&id, None, Protocol::Nvmf, true, false)
            .await
            .unwrap();
        let second = moved.spec.target_config.unwrap();
        assert_ne!(first.node, second.node);

        let destroyed = rig.volumes.destroy_shutdown_targets(&id).await.unwrap();
        assert_eq!(destroyed, 1);
    }
}
