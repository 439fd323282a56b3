//! Target Publisher
//!
//! Publishes volumes over NVMe-oF and moves targets between nodes. The
//! volume NQN never changes, so every path a host sees belongs to the same
//! subsystem; a republish brings up the new target first, then shuts the
//! old one down and retires it until `destroy_shutdown_targets` collects it.
//! During the switchover both paths exist on distinct node addresses.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::bounded;
use super::nexus::NexusManager;
use crate::engine::IoEngineRef;
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::resources::{
    volume_nqn, Nexus, NodeId, Path, PathState, Protocol, Replica, TargetConfig, VolumeId,
    VolumeSpec,
};

/// Target publish and switchover operations
pub struct TargetPublisher {
    registry: Arc<Registry>,
    engine: IoEngineRef,
    nexuses: Arc<NexusManager>,
    conn_timeout: Duration,
}

impl TargetPublisher {
    pub fn new(
        registry: Arc<Registry>,
        engine: IoEngineRef,
        nexuses: Arc<NexusManager>,
        conn_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            engine,
            nexuses,
            conn_timeout,
        })
    }

    /// Publish a volume target, optionally on a caller-chosen node
    ///
    /// Without an explicit node the target prefers a node already hosting
    /// one of the volume's replicas, so reads stay local.
    pub async fn publish(
        &self,
        spec: &VolumeSpec,
        node: Option<NodeId>,
        protocol: Protocol,
    ) -> Result<VolumeSpec> {
        if spec.deleting {
            return Err(Error::VolumeDeleting {
                volume: spec.uuid.to_string(),
            });
        }
        if let Some(target) = &spec.target_config {
            return Err(Error::AlreadyPublished {
                volume: spec.uuid.to_string(),
                node: target.node.to_string(),
            });
        }

        let replicas = self.registry.resources.replicas_of(&spec.uuid);
        if replicas.is_empty() {
            return Err(Error::NoOnlineReplicas {
                volume: spec.uuid.to_string(),
            });
        }

        let node = match node {
            Some(node) => {
                if !self.registry.nodes.is_online(&node) {
                    return Err(Error::NodeUnreachable {
                        node_id: node.to_string(),
                    });
                }
                node
            }
            None => self.pick_target_node(&spec.uuid, &replicas, &HashSet::new())?,
        };

        let nexus = self
            .nexuses
            .create_nexus(&spec.uuid, &node, &replicas, spec.size_bytes)
            .await?;
        let device_uri = self.share_or_cleanup(&nexus, &spec.uuid).await?;
        self.record_path(&nexus, &device_uri);

        let updated = self
            .registry
            .resources
            .update_volume_spec(&spec.uuid, |s| {
                s.target_config = Some(TargetConfig {
                    node: node.clone(),
                    protocol,
                    nexus: nexus.id,
                    device_uri: device_uri.clone(),
                });
            })?;

        info!(volume = %spec.uuid, node = %node, uri = %device_uri, "Volume published");
        Ok(updated)
    }

    /// Move the target to another node, keeping the NQN
    ///
    /// The new nexus comes up and is shared before the incumbent is shut
    /// down, so a host always has at least one usable path. The incumbent
    /// node is never reused; nodes with Lost paths are avoided when other
    /// candidates exist.
    pub async fn republish(&self, spec: &VolumeSpec) -> Result<VolumeSpec> {
        if spec.deleting {
            return Err(Error::VolumeDeleting {
                volume: spec.uuid.to_string(),
            });
        }
        let target = spec.target_config.clone().ok_or_else(|| Error::NotPublished {
            volume: spec.uuid.to_string(),
        })?;

        let replicas = self.registry.resources.replicas_of(&spec.uuid);
        if replicas.is_empty() {
            return Err(Error::NoOnlineReplicas {
                volume: spec.uuid.to_string(),
            });
        }

        let mut exclude: HashSet<NodeId> = HashSet::new();
        exclude.insert(target.node.clone());
        let lost_nodes: HashSet<NodeId> = self
            .registry
            .resources
            .paths_of(&spec.uuid)
            .into_iter()
            .filter(|p| p.state == PathState::Lost)
            .map(|p| p.node)
            .collect();

        let mut preferred = exclude.clone();
        preferred.extend(lost_nodes.iter().cloned());
        let node = match self.pick_target_node(&spec.uuid, &replicas, &preferred) {
            Ok(node) => node,
            // fall back to lost-path nodes rather than fail the switchover
            Err(_) if !lost_nodes.is_empty() => {
                self.pick_target_node(&spec.uuid, &replicas, &exclude)?
            }
            Err(err) => return Err(err),
        };

        let new_nexus = self
            .nexuses
            .create_nexus(&spec.uuid, &node, &replicas, spec.size_bytes)
            .await?;
        let device_uri = self.share_or_cleanup(&new_nexus, &spec.uuid).await?;
        self.record_path(&new_nexus, &device_uri);

        // retire the incumbent only after the replacement is reachable
        if let Some(old) = self.registry.resources.get_nexus(&target.nexus) {
            let outcome = bounded(
                &old.node,
                self.conn_timeout,
                self.engine.shutdown_nexus(&old.node, &old.id),
            )
            .await;
            match outcome {
                Ok(()) | Err(Error::NotFound { .. }) => {}
                Err(err) => warn!(
                    nexus = %old.id,
                    node = %old.node,
                    error = %err,
                    "Old target shutdown failed, retiring record anyway"
                ),
            }
            self.registry.resources.set_nexus_shutdown(&old.id)?;
        }

        let updated = self
            .registry
            .resources
            .update_volume_spec(&spec.uuid, |s| {
                s.target_config = Some(TargetConfig {
                    node: node.clone(),
                    protocol: target.protocol,
                    nexus: new_nexus.id,
                    device_uri: device_uri.clone(),
                });
            })?;

        info!(
            volume = %spec.uuid,
            from = %target.node,
            to = %node,
            uri = %device_uri,
            "Volume republished"
        );
        Ok(updated)
    }

    /// Tear the target down
    ///
    /// Fails when the target node is unreachable unless `force` is set;
    /// a forced unpublish drops the records and leaves the engine object
    /// for collection.
    pub async fn unpublish(&self, spec: &VolumeSpec, force: bool) -> Result<VolumeSpec> {
        if spec.target_config.is_none() {
            return Err(Error::NotPublished {
                volume: spec.uuid.to_string(),
            });
        }

        if let Some(nexus) = self.registry.resources.target_nexus_of(&spec.uuid) {
            self.nexuses.destroy_nexus(&nexus, force).await?;
        }

        let updated = self
            .registry
            .resources
            .update_volume_spec(&spec.uuid, |s| s.target_config = None)?;
        info!(volume = %spec.uuid, "Volume unpublished");
        Ok(updated)
    }

    /// Destroy retired targets left behind by republishes
    ///
    /// Unreachable nodes are skipped and retried on a later call. Returns
    /// how many targets were destroyed.
    pub async fn destroy_shutdown_targets(&self, volume: &VolumeId) -> Result<usize> {
        let mut destroyed = 0;
        for nexus in self.registry.resources.shutdown_nexuses_of(volume) {
            match self.nexuses.destroy_nexus(&nexus, false).await {
                Ok(()) => destroyed += 1,
                Err(Error::NodeUnreachable { .. }) | Err(Error::NodeNotFound { .. }) => {
                    debug!(nexus = %nexus.id, node = %nexus.node, "Retired target left for later");
                }
                Err(err) => return Err(err),
            }
        }
        if destroyed > 0 {
            info!(volume = %volume, count = destroyed, "Shutdown targets destroyed");
        }
        Ok(destroyed)
    }

    /// Choose a target node: online, outside `exclude`, replica-local when
    /// possible, lowest node id as the final tie break
    fn pick_target_node(
        &self,
        volume: &VolumeId,
        replicas: &[Replica],
        exclude: &HashSet<NodeId>,
    ) -> Result<NodeId> {
        let mut online = self.registry.nodes.online_node_ids();
        online.sort();
        let replica_nodes: HashSet<&NodeId> = replicas.iter().map(|r| &r.node).collect();

        let candidates: Vec<&NodeId> =
            online.iter().filter(|n| !exclude.contains(*n)).collect();
        if let Some(local) = candidates.iter().find(|n| replica_nodes.contains(**n)) {
            return Ok((**local).clone());
        }
        candidates
            .first()
            .map(|n| (**n).clone())
            .ok_or_else(|| Error::NoSuitableNode {
                volume: volume.to_string(),
                reason: "no online node outside the excluded set".into(),
            })
    }

    async fn share_or_cleanup(&self, nexus: &Nexus, volume: &VolumeId) -> Result<String> {
        let nqn = volume_nqn(volume);
        let shared = bounded(
            &nexus.node,
            self.conn_timeout,
            self.engine.share_nexus(&nexus.node, &nexus.id, &nqn),
        )
        .await;
        match shared {
            Ok(uri) => Ok(uri),
            Err(err) => {
                warn!(
                    volume = %volume,
                    nexus = %nexus.id,
                    error = %err,
                    "Share failed, destroying the new nexus"
                );
                if let Err(cleanup) = self.nexuses.destroy_nexus(nexus, true).await {
                    warn!(nexus = %nexus.id, error = %cleanup, "Cleanup destroy failed");
                }
                Err(err)
            }
        }
    }

    fn record_path(&self, nexus: &Nexus, device_uri: &str) {
        let address = self
            .registry
            .nodes
            .get(&nexus.node)
            .map(|n| n.address().to_string())
            .unwrap_or_else(|| nexus.node.to_string());
        self.registry.resources.upsert_path(Path {
            volume: nexus.volume,
            nexus: nexus.id,
            node: nexus.node.clone(),
            address,
            device_uri: device_uri.to_string(),
            state: PathState::Connecting,
            created_at: Utc::now(),
        });
    }
}
