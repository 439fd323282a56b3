//! Pool Service
//!
//! Creates and destroys pools through the engine seam. Deleting a pool that
//! still hosts replicas requires `cascade`; cascaded volume-owned replicas
//! are disowned first so the reconciler can re-place them elsewhere.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use super::bounded;
use crate::engine::IoEngineRef;
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::resources::{NodeId, Pool, PoolId, PoolStatus};

/// Pool lifecycle operations
pub struct PoolService {
    registry: Arc<Registry>,
    engine: IoEngineRef,
    conn_timeout: Duration,
}

impl PoolService {
    pub fn new(registry: Arc<Registry>, engine: IoEngineRef, conn_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry,
            engine,
            conn_timeout,
        })
    }

    /// Create a pool on a registered node
    pub async fn create_pool(
        &self,
        node_id: &NodeId,
        pool_id: &PoolId,
        disks: Vec<String>,
    ) -> Result<Pool> {
        info!(node = %node_id, pool = %pool_id, "Creating pool");

        if !self.registry.nodes.contains(node_id) {
            return Err(Error::NodeNotFound {
                node_id: node_id.to_string(),
            });
        }
        if self.registry.resources.get_pool(pool_id).is_some() {
            return Err(Error::AlreadyExists {
                kind: "pool".into(),
                id: pool_id.to_string(),
            });
        }

        let state = bounded(
            node_id,
            self.conn_timeout,
            self.engine.create_pool(node_id, pool_id, &disks),
        )
        .await?;

        let pool = Pool {
            id: pool_id.clone(),
            node: node_id.clone(),
            disks,
            capacity_bytes: state.capacity_bytes,
            used_bytes: state.used_bytes,
            status: PoolStatus::Online,
            created_at: Utc::now(),
        };
        self.registry.resources.insert_pool(pool.clone())?;

        info!(pool = %pool_id, capacity = pool.capacity_bytes, "Pool created");
        Ok(pool)
    }

    /// Delete a pool, cascading over resident replicas when asked
    pub async fn delete_pool(&self, pool_id: &PoolId, cascade: bool) -> Result<()> {
        let pool = self
            .registry
            .resources
            .get_pool(pool_id)
            .ok_or_else(|| Error::not_found("pool", pool_id))?;

        let residents = self.registry.resources.replicas_on_pool(pool_id);
        if !residents.is_empty() && !cascade {
            return Err(Error::ResourceInUse {
                kind: "pool".into(),
                id: pool_id.to_string(),
                reason: format!("{} replica(s) present, pass cascade=true", residents.len()),
            });
        }

        for replica in residents {
            if replica.owner.is_some() {
                warn!(
                    pool = %pool_id,
                    replica = %replica.id,
                    volume = ?replica.owner,
                    "Cascade delete disowns a volume replica"
                );
                self.registry.resources.disown_replica(&replica.id)?;
            }
            match bounded(
                &pool.node,
                self.conn_timeout,
                self.engine.destroy_replica(&pool.node, pool_id, &replica.id),
            )
            .await
            {
                Ok(()) | Err(Error::NotFound { .. }) => {
                    self.registry.resources.remove_replica(&replica.id);
                }
                Err(err) => return Err(err),
            }
        }

        match bounded(
            &pool.node,
            self.conn_timeout,
            self.engine.destroy_pool(&pool.node, pool_id),
        )
        .await
        {
            Ok(()) | Err(Error::NotFound { .. }) => {}
            Err(err) => return Err(err),
        }
        self.registry.resources.remove_pool(pool_id)?;

        info!(pool = %pool_id, "Pool deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{InProcessEngine, IoEngineApi};
    use crate::resources::{Replica, ReplicaId, VolumeId};
    use assert_matches::assert_matches;

    async fn service() -> (Arc<PoolService>, Arc<Registry>, Arc<InProcessEngine>) {
        let registry = Registry::new();
        let engine = InProcessEngine::new();
        engine.add_node("io-engine-1", "10.1.0.5:10124");
        registry
            .nodes
            .register("io-engine-1", "10.1.0.5:10124")
            .unwrap();
        let service = PoolService::new(
            registry.clone(),
            engine.clone(),
            Duration::from_millis(250),
        );
        (service, registry, engine)
    }

    #[tokio::test]
    async fn test_create_pool_records_engine_capacity() {
        let (service, registry, _) = service().await;
        let node = NodeId::from("io-engine-1");
        let pool_id = PoolId::from("pool-1");

        let pool = service
            .create_pool(&node, &pool_id, vec!["malloc:///disk0?size_mb=64".into()])
            .await
            .unwrap();
        assert_eq!(pool.capacity_bytes, 64 * 1024 * 1024);
        assert!(registry.resources.get_pool(&pool_id).is_some());

        // same id again is rejected before touching the engine
        let err = service
            .create_pool(&node, &pool_id, vec!["malloc:///disk1?size_mb=64".into()])
            .await
            .unwrap_err();
        assert_matches!(err, Error::AlreadyExists { .. });
    }

    #[tokio::test]
    async fn test_create_pool_on_unknown_node() {
        let (service, _, _) = service().await;
        let err = service
            .create_pool(
                &NodeId::from("no-such-node"),
                &PoolId::from("pool-1"),
                vec!["malloc:///disk0?size_mb=64".into()],
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::NodeNotFound { .. });
    }

    #[tokio::test]
    async fn test_delete_pool_requires_cascade_when_occupied() {
        let (service, registry, engine) = service().await;
        let node = NodeId::from("io-engine-1");
        let pool_id = PoolId::from("pool-1");
        service
            .create_pool(&node, &pool_id, vec!["malloc:///disk0?size_mb=100".into()])
            .await
            .unwrap();

        let volume = VolumeId::new_random();
        let replica_id = ReplicaId::new_random();
        let uri = engine
            .create_replica(&node, &pool_id, &replica_id, 10 * 1024 * 1024, false)
            .await
            .unwrap();
        registry.resources.insert_replica(Replica {
            id: replica_id,
            owner: Some(volume),
            pool: pool_id.clone(),
            node: node.clone(),
            size_bytes: 10 * 1024 * 1024,
            thin: false,
            uri,
            created_at: Utc::now(),
        });

        let err = service.delete_pool(&pool_id, false).await.unwrap_err();
        assert_matches!(err, Error::ResourceInUse { .. });

        // cascade disowns and destroys the resident replica
        service.delete_pool(&pool_id, true).await.unwrap();
        assert!(registry.resources.get_pool(&pool_id).is_none());
        assert!(registry.resources.list_replicas().is_empty());
        let state = engine.node_state(&node).await.unwrap();
        assert!(state.pools.is_empty());
    }
}
