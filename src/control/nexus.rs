//! Nexus Manager
//!
//! Creates and destroys nexuses and edits their child sets through the
//! engine seam, keeping the registry records in step. Child health coming
//! in from liveness events is applied here; the eviction policy that acts
//! on faulted children lives in the reconciler.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::bounded;
use crate::engine::IoEngineRef;
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::resources::{Child, ChildState, Nexus, NexusId, NodeId, Replica, ReplicaId, VolumeId};

/// Nexus lifecycle and child management
pub struct NexusManager {
    registry: Arc<Registry>,
    engine: IoEngineRef,
    conn_timeout: Duration,
}

impl NexusManager {
    pub fn new(registry: Arc<Registry>, engine: IoEngineRef, conn_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry,
            engine,
            conn_timeout,
        })
    }

    /// Create a nexus for `volume` on `node` over the given replicas
    ///
    /// Initial children are the data sources and start Online. Fails with
    /// `NodeUnreachable` when the hosting node is not Online.
    pub async fn create_nexus(
        &self,
        volume: &VolumeId,
        node: &NodeId,
        replicas: &[Replica],
        size_bytes: u64,
    ) -> Result<Nexus> {
        if !self.registry.nodes.is_online(node) {
            return Err(Error::NodeUnreachable {
                node_id: node.to_string(),
            });
        }

        let nexus_id = NexusId::new_random();
        let uris: Vec<String> = replicas.iter().map(|r| r.uri.clone()).collect();
        bounded(
            node,
            self.conn_timeout,
            self.engine
                .create_nexus(node, &nexus_id, volume, size_bytes, &uris),
        )
        .await?;

        let nexus = Nexus {
            id: nexus_id,
            volume: *volume,
            node: node.clone(),
            children: replicas
                .iter()
                .map(|r| Child::new(r.id, r.uri.clone(), ChildState::Online))
                .collect(),
            shutdown: false,
            created_at: Utc::now(),
        };
        self.registry.resources.insert_nexus(nexus.clone());

        info!(volume = %volume, nexus = %nexus_id, node = %node, children = replicas.len(), "Nexus created");
        Ok(nexus)
    }

    /// Destroy a nexus and drop its record and path
    ///
    /// Without `force` an unreachable hosting node fails the call, since the
    /// target may still be serving hosts. With `force` the record goes away
    /// regardless and the engine-side object is collected when the node
    /// returns.
    pub async fn destroy_nexus(&self, nexus: &Nexus, force: bool) -> Result<()> {
        let outcome = bounded(
            &nexus.node,
            self.conn_timeout,
            self.engine.destroy_nexus(&nexus.node, &nexus.id),
        )
        .await;
        match outcome {
            Ok(()) | Err(Error::NotFound { .. }) => {}
            Err(err @ Error::NodeUnreachable { .. }) | Err(err @ Error::NodeNotFound { .. }) => {
                if !force {
                    return Err(err);
                }
                warn!(
                    nexus = %nexus.id,
                    node = %nexus.node,
                    "Node unreachable, engine nexus left for collection"
                );
            }
            Err(err) => return Err(err),
        }
        self.registry.resources.remove_nexus(&nexus.id);
        self.registry.resources.remove_path(&nexus.id);
        info!(volume = %nexus.volume, nexus = %nexus.id, "Nexus destroyed");
        Ok(())
    }

    /// Attach a replica as a new child; it starts Degraded until rebuilt
    pub async fn attach_replica(&self, nexus: &Nexus, replica: &Replica) -> Result<()> {
        bounded(
            &nexus.node,
            self.conn_timeout,
            self.engine.add_child(&nexus.node, &nexus.id, &replica.uri),
        )
        .await?;
        self.registry.resources.add_nexus_child(
            &nexus.id,
            Child::new(replica.id, replica.uri.clone(), ChildState::Degraded),
        )?;
        debug!(nexus = %nexus.id, replica = %replica.id, "Child attached");
        Ok(())
    }

    /// Detach a child from the nexus, leaving the replica itself alone
    pub async fn detach_child(&self, nexus: &Nexus, replica: &ReplicaId) -> Result<()> {
        let child = nexus
            .child(replica)
            .ok_or_else(|| Error::not_found("child", replica))?;
        let outcome = bounded(
            &nexus.node,
            self.conn_timeout,
            self.engine
                .remove_child(&nexus.node, &nexus.id, &child.uri),
        )
        .await;
        match outcome {
            Ok(()) | Err(Error::NotFound { .. }) => {}
            Err(err) => return Err(err),
        }
        self.registry.resources.remove_nexus_child(&nexus.id, replica)?;
        debug!(nexus = %nexus.id, replica = %replica, "Child detached");
        Ok(())
    }

    /// Fault a volume's children backed by replicas on `node`
    ///
    /// Applied under the volume lock on `NodeWentOffline` so the grace
    /// clock starts from the liveness event rather than the next poll.
    /// Returns the number of children newly faulted.
    pub fn fault_children_on_node(&self, volume: &VolumeId, node: &NodeId) -> usize {
        let mut faulted = 0;
        for nexus in self.registry.resources.nexuses_of(volume) {
            if nexus.shutdown {
                continue;
            }
            for child in &nexus.children {
                if child.state == ChildState::Faulted {
                    continue;
                }
                let on_dead_node = self
                    .registry
                    .resources
                    .get_replica(&child.replica)
                    .map(|r| &r.node == node)
                    .unwrap_or(false);
                if on_dead_node
                    && self
                        .registry
                        .resources
                        .set_child_state(&nexus.id, &child.replica, ChildState::Faulted)
                        .is_ok()
                {
                    faulted += 1;
                }
            }
        }
        if faulted > 0 {
            info!(volume = %volume, node = %node, count = faulted, "Children faulted after node loss");
        }
        faulted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{InProcessEngine, IoEngineApi};
    use crate::resources::{NexusStatus, PoolId};
    use assert_matches::assert_matches;

    const MB: u64 = 1024 * 1024;

    async fn cluster() -> (Arc<Registry>, Arc<InProcessEngine>, Arc<NexusManager>) {
        let registry = Registry::new();
        let engine = InProcessEngine::new();
        for (node, endpoint) in [
            ("io-engine-1", "10.1.0.5:10124"),
            ("io-engine-2", "10.1.0.6:10124"),
        ] {
            engine.add_node(node, endpoint);
            registry.nodes.register(node, endpoint).unwrap();
        }
        let manager = NexusManager::new(
            registry.clone(),
            engine.clone(),
            Duration::from_millis(250),
        );
        (registry, engine, manager)
    }

    async fn replica_on(
        registry: &Registry,
        engine: &InProcessEngine,
        node: &str,
        volume: &VolumeId,
    ) -> Replica {
        let node_id = NodeId::from(node);
        let pool_id = PoolId::from(format!("pool-{}", node));
        if registry.resources.get_pool(&pool_id).is_none() {
            let state = engine
                .create_pool(&node_id, &pool_id, &["malloc:///disk0?size_mb=100".into()])
                .await
                .unwrap();
            registry
                .resources
                .insert_pool(crate::resources::Pool {
                    id: pool_id.clone(),
                    node: node_id.clone(),
                    disks: vec!["malloc:///disk0?size_mb=100".into()],
                    capacity_bytes: state.capacity_bytes,
                    used_bytes: state.used_bytes,
                    status: crate::resources::PoolStatus::Online,
                    created_at: Utc::now(),
                })
                .unwrap();
        }
        let replica_id = ReplicaId::new_random();
        let uri = engine
            .create_replica(&node_id, &pool_id, &replica_id, 10 * MB, false)
            .await
            .unwrap();
        let replica = Replica {
            id: replica_id,
            owner: Some(*volume),
            pool: pool_id,
            node: node_id,
            size_bytes: 10 * MB,
            thin: false,
            uri,
            created_at: Utc::now(),
        };
        registry.resources.insert_replica(replica.clone());
        replica
    }

    #[tokio::test]
    async fn test_create_attach_detach() {
        let (registry, engine, manager) = cluster().await;
        let volume = VolumeId::new_random();
        let r1 = replica_on(&registry, &engine, "io-engine-1", &volume).await;
        let r2 = replica_on(&registry, &engine, "io-engine-2", &volume).await;

        let nexus = manager
            .create_nexus(&volume, &NodeId::from("io-engine-1"), &[r1.clone()], 10 * MB)
            .await
            .unwrap();
        assert_eq!(nexus.status(), NexusStatus::Online);

        manager.attach_replica(&nexus, &r2).await.unwrap();
        let stored = registry.resources.get_nexus(&nexus.id).unwrap();
        assert_eq!(stored.children.len(), 2);
        assert_eq!(
            stored.child(&r2.id).unwrap().state,
            ChildState::Degraded
        );

        let stored = registry.resources.get_nexus(&nexus.id).unwrap();
        manager.detach_child(&stored, &r2.id).await.unwrap();
        let stored = registry.resources.get_nexus(&nexus.id).unwrap();
        assert_eq!(stored.children.len(), 1);

        manager.destroy_nexus(&stored, false).await.unwrap();
        assert!(registry.resources.get_nexus(&nexus.id).is_none());
        let state = engine
            .node_state(&NodeId::from("io-engine-1"))
            .await
            .unwrap();
        assert!(state.nexuses.is_empty());
    }

    #[tokio::test]
    async fn test_create_on_offline_node_fails_fast() {
        let (registry, engine, manager) = cluster().await;
        let volume = VolumeId::new_random();
        let r1 = replica_on(&registry, &engine, "io-engine-2", &volume).await;

        registry
            .nodes
            .mark_offline(&NodeId::from("io-engine-1"))
            .unwrap();
        let err = manager
            .create_nexus(&volume, &NodeId::from("io-engine-1"), &[r1], 10 * MB)
            .await
            .unwrap_err();
        assert_matches!(err, Error::NodeUnreachable { .. });
    }

    #[tokio::test]
    async fn test_fault_children_on_node_stamps_grace_clock() {
        let (registry, engine, manager) = cluster().await;
        let volume = VolumeId::new_random();
        let r1 = replica_on(&registry, &engine, "io-engine-1", &volume).await;
        let r2 = replica_on(&registry, &engine, "io-engine-2", &volume).await;

        let nexus = manager
            .create_nexus(
                &volume,
                &NodeId::from("io-engine-1"),
                &[r1.clone(), r2.clone()],
                10 * MB,
            )
            .await
            .unwrap();

        assert_eq!(
            manager.fault_children_on_node(&volume, &NodeId::from("io-engine-2")),
            1
        );
        // repeat application is a no-op, the clock keeps its first stamp
        assert_eq!(
            manager.fault_children_on_node(&volume, &NodeId::from("io-engine-2")),
            0
        );

        let stored = registry.resources.get_nexus(&nexus.id).unwrap();
        let child = stored.child(&r2.id).unwrap();
        assert_eq!(child.state, ChildState::Faulted);
        assert!(child.faulted_at.is_some());
        assert_eq!(stored.child(&r1.id).unwrap().state, ChildState::Online);
        assert_eq!(stored.status(), NexusStatus::Degraded);
    }

    #[tokio::test]
    async fn test_destroy_on_dead_node_requires_force() {
        let (registry, engine, manager) = cluster().await;
        let volume = VolumeId::new_random();
        let r1 = replica_on(&registry, &engine, "io-engine-1", &volume).await;

        let nexus = manager
            .create_nexus(&volume, &NodeId::from("io-engine-1"), &[r1], 10 * MB)
            .await
            .unwrap();

        engine.kill_node(&NodeId::from("io-engine-1"));
        let err = manager.destroy_nexus(&nexus, false).await.unwrap_err();
        assert_matches!(err, Error::NodeUnreachable { .. });
        assert!(registry.resources.get_nexus(&nexus.id).is_some());

        manager.destroy_nexus(&nexus, true).await.unwrap();
        assert!(registry.resources.get_nexus(&nexus.id).is_none());
    }
}
