//! Replica Manager
//!
//! Creates and destroys replicas on pools through the engine seam. Creation
//! is transactional per request: replicas land on distinct pools and nodes,
//! and a mid-batch failure rolls back the ones already created. Destroying
//! a replica whose node is unreachable disowns it instead; disowned replicas
//! are garbage collected once the node comes back.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::bounded;
use super::placement::PlacementEngine;
use crate::engine::IoEngineRef;
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::resources::{NodeId, PoolId, Replica, ReplicaId, VolumeSpec};

/// Replica lifecycle operations
pub struct ReplicaManager {
    registry: Arc<Registry>,
    engine: IoEngineRef,
    conn_timeout: Duration,
}

impl ReplicaManager {
    pub fn new(registry: Arc<Registry>, engine: IoEngineRef, conn_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry,
            engine,
            conn_timeout,
        })
    }

    /// Create `count` replicas for a volume on distinct pools and nodes
    ///
    /// Nodes already hosting a replica of this volume are excluded. On any
    /// creation failure the replicas created so far are rolled back and the
    /// error is returned.
    pub async fn create_replicas(&self, spec: &VolumeSpec, count: usize) -> Result<Vec<Replica>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let exclude: HashSet<NodeId> = self
            .registry
            .resources
            .replicas_of(&spec.uuid)
            .into_iter()
            .map(|r| r.node)
            .collect();
        let candidates = PlacementEngine::eligible_candidates(
            &self.registry.resources,
            &self.registry.nodes,
            spec.size_bytes,
        );
        let placement = PlacementEngine::select(&spec.uuid, &candidates, count, &exclude)?;

        let mut created: Vec<Replica> = Vec::with_capacity(count);
        for target in &placement.selected {
            let replica_id = ReplicaId::new_random();
            let outcome = bounded(
                &target.node,
                self.conn_timeout,
                self.engine.create_replica(
                    &target.node,
                    &target.pool,
                    &replica_id,
                    spec.size_bytes,
                    spec.thin,
                ),
            )
            .await;

            match outcome {
                Ok(uri) => {
                    let replica = Replica {
                        id: replica_id,
                        owner: Some(spec.uuid),
                        pool: target.pool.clone(),
                        node: target.node.clone(),
                        size_bytes: spec.size_bytes,
                        thin: spec.thin,
                        uri,
                        created_at: Utc::now(),
                    };
                    self.registry.resources.insert_replica(replica.clone());
                    if !spec.thin {
                        self.adjust_pool_used(&target.pool, spec.size_bytes as i64);
                    }
                    debug!(volume = %spec.uuid, replica = %replica_id, pool = %target.pool, "Replica created");
                    created.push(replica);
                }
                Err(err) => {
                    warn!(
                        volume = %spec.uuid,
                        node = %target.node,
                        error = %err,
                        "Replica creation failed, rolling back batch"
                    );
                    self.rollback(&created).await;
                    return Err(err);
                }
            }
        }

        info!(volume = %spec.uuid, count = created.len(), "Replicas created");
        Ok(created)
    }

    async fn rollback(&self, created: &[Replica]) {
        for replica in created {
            if let Err(err) = self.destroy(replica).await {
                warn!(replica = %replica.id, error = %err, "Rollback destroy failed");
            }
        }
    }

    /// Destroy a replica, disowning it when its node cannot be reached
    pub async fn destroy(&self, replica: &Replica) -> Result<()> {
        let outcome = bounded(
            &replica.node,
            self.conn_timeout,
            self.engine
                .destroy_replica(&replica.node, &replica.pool, &replica.id),
        )
        .await;

        match outcome {
            Ok(()) | Err(Error::NotFound { .. }) => {
                self.registry.resources.remove_replica(&replica.id);
                if !replica.thin {
                    self.adjust_pool_used(&replica.pool, -(replica.size_bytes as i64));
                }
                Ok(())
            }
            Err(Error::NodeUnreachable { .. }) | Err(Error::NodeNotFound { .. }) => {
                info!(
                    replica = %replica.id,
                    node = %replica.node,
                    "Node unreachable, disowning replica for later collection"
                );
                self.registry.resources.disown_replica(&replica.id)?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Garbage-collect disowned replicas on a node that is reachable again
    ///
    /// Returns how many replicas were destroyed. Stops at the first engine
    /// failure; the next reconcile pass picks the remainder up.
    pub async fn collect_disowned_on(&self, node: &NodeId) -> usize {
        let mut destroyed = 0;
        for replica in self.registry.resources.disowned_replicas_on(node) {
            let outcome = bounded(
                node,
                self.conn_timeout,
                self.engine.destroy_replica(node, &replica.pool, &replica.id),
            )
            .await;
            match outcome {
                Ok(()) | Err(Error::NotFound { .. }) => {
                    self.registry.resources.remove_replica(&replica.id);
                    if !replica.thin {
                        self.adjust_pool_used(&replica.pool, -(replica.size_bytes as i64));
                    }
                    destroyed += 1;
                }
                Err(err) => {
                    debug!(node = %node, error = %err, "Disowned replica collection interrupted");
                    break;
                }
            }
        }
        if destroyed > 0 {
            info!(node = %node, count = destroyed, "Collected disowned replicas");
        }
        destroyed
    }

    /// Nudge recorded pool usage between poller refreshes
    fn adjust_pool_used(&self, pool_id: &PoolId, delta: i64) {
        if let Some(pool) = self.registry.resources.get_pool(pool_id) {
            let used = if delta >= 0 {
                pool.used_bytes.saturating_add(delta as u64)
            } else {
                pool.used_bytes.saturating_sub(delta.unsigned_abs())
            };
            self.registry
                .resources
                .set_pool_usage(pool_id, pool.capacity_bytes, used);
        }
    }
}
