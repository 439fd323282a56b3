//! In-process engine cluster
//!
//! Emulates a set of io-engine nodes behind [`IoEngineApi`]: pools with
//! capacity accounting, replicas exported over fake NVMe-oF URIs, nexuses
//! with per-child rebuild state, and a kill switch per node. Child health
//! follows the exporter: when the node exporting a replica dies, every nexus
//! child dialing that replica reports Faulted, exactly what a real nexus
//! observes when its remote child drops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{
    EngineChildState, EngineNexusState, EngineNodeState, EnginePoolState, EngineReplicaState,
    IoEngineApi,
};
use crate::error::{Error, Result};
use crate::registry::NodeRegistry;
use crate::resources::{ChildState, NexusId, NodeId, PoolId, ReplicaId, VolumeId};

/// Capacity assumed for disks that do not encode one
const DEFAULT_DISK_CAPACITY: u64 = 100 * 1024 * 1024;

// =============================================================================
// Emulated node state
// =============================================================================

#[derive(Debug, Clone)]
struct EmReplica {
    size_bytes: u64,
    thin: bool,
    uri: String,
}

#[derive(Debug, Clone)]
struct EmPool {
    capacity_bytes: u64,
    used_bytes: u64,
    replicas: HashMap<ReplicaId, EmReplica>,
}

#[derive(Debug, Clone)]
struct EmChild {
    uri: String,
    state: ChildState,
    added_at: Instant,
}

#[derive(Debug, Clone)]
struct EmNexus {
    children: Vec<EmChild>,
    nqn: Option<String>,
    device_uri: Option<String>,
    shared_at: Option<Instant>,
    shutdown: bool,
}

#[derive(Debug, Clone)]
struct EmNode {
    endpoint: String,
    alive: bool,
    pools: HashMap<PoolId, EmPool>,
    nexuses: HashMap<NexusId, EmNexus>,
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<NodeId, EmNode>,
    /// Replica share URI to exporting node
    exports: HashMap<String, NodeId>,
}

// =============================================================================
// In-process engine
// =============================================================================

/// Emulated io-engine cluster
pub struct InProcessEngine {
    inner: RwLock<Inner>,
    /// How long an added child stays Degraded before reporting Online
    rebuild_delay: Duration,
    /// How long a shared target stays unconnected
    connect_delay: Duration,
}

impl InProcessEngine {
    pub fn new() -> Arc<Self> {
        Self::with_delays(Duration::ZERO, Duration::ZERO)
    }

    /// Create an engine with explicit rebuild and fabric-connect latencies
    pub fn with_delays(rebuild_delay: Duration, connect_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner::default()),
            rebuild_delay,
            connect_delay,
        })
    }

    /// Add an emulated node
    pub fn add_node(&self, node: impl Into<NodeId>, endpoint: impl Into<String>) {
        let node = node.into();
        let endpoint = endpoint.into();
        debug!(node = %node, %endpoint, "engine node added");
        self.inner.write().nodes.insert(
            node,
            EmNode {
                endpoint,
                alive: true,
                pools: HashMap::new(),
                nexuses: HashMap::new(),
            },
        );
    }

    /// Stop a node; state is retained and returns on revive
    pub fn kill_node(&self, node: &NodeId) -> bool {
        let mut inner = self.inner.write();
        match inner.nodes.get_mut(node) {
            Some(n) if n.alive => {
                n.alive = false;
                debug!(node = %node, "engine node killed");
                true
            }
            _ => false,
        }
    }

    /// Bring a killed node back
    pub fn revive_node(&self, node: &NodeId) -> bool {
        let mut inner = self.inner.write();
        match inner.nodes.get_mut(node) {
            Some(n) if !n.alive => {
                n.alive = true;
                debug!(node = %node, "engine node revived");
                true
            }
            _ => false,
        }
    }

    /// Nodes currently alive
    pub fn alive_nodes(&self) -> Vec<NodeId> {
        self.inner
            .read()
            .nodes
            .iter()
            .filter(|(_, n)| n.alive)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn with_node<T>(&self, node: &NodeId, f: impl FnOnce(&Inner, &EmNode) -> Result<T>) -> Result<T> {
        let inner = self.inner.read();
        let n = inner.nodes.get(node).ok_or_else(|| Error::NodeNotFound {
            node_id: node.to_string(),
        })?;
        if !n.alive {
            return Err(Error::NodeUnreachable {
                node_id: node.to_string(),
            });
        }
        f(&inner, n)
    }

    fn with_node_mut<T>(
        &self,
        node: &NodeId,
        f: impl FnOnce(&mut HashMap<String, NodeId>, &mut EmNode) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.inner.write();
        let inner = &mut *inner;
        let n = inner
            .nodes
            .get_mut(node)
            .ok_or_else(|| Error::NodeNotFound {
                node_id: node.to_string(),
            })?;
        if !n.alive {
            return Err(Error::NodeUnreachable {
                node_id: node.to_string(),
            });
        }
        f(&mut inner.exports, n)
    }

    /// Effective health of one child as the hosting nexus sees it
    fn child_view(&self, inner: &Inner, child: &EmChild) -> ChildState {
        match inner.exports.get(&child.uri) {
            // exporter gone or dead: the connection is down
            None => ChildState::Faulted,
            Some(exporter) => match inner.nodes.get(exporter) {
                Some(n) if n.alive => {
                    if child.state == ChildState::Degraded
                        && child.added_at.elapsed() >= self.rebuild_delay
                    {
                        ChildState::Online
                    } else {
                        child.state
                    }
                }
                _ => ChildState::Faulted,
            },
        }
    }
}

// =============================================================================
// IoEngineApi implementation
// =============================================================================

#[async_trait]
impl IoEngineApi for InProcessEngine {
    async fn create_pool(
        &self,
        node: &NodeId,
        pool: &PoolId,
        disks: &[String],
    ) -> Result<EnginePoolState> {
        self.with_node_mut(node, |_, n| {
            if n.pools.contains_key(pool) {
                return Err(Error::AlreadyExists {
                    kind: "pool".into(),
                    id: pool.to_string(),
                });
            }
            let capacity_bytes = disks.iter().map(|d| disk_capacity(d)).sum();
            n.pools.insert(
                pool.clone(),
                EmPool {
                    capacity_bytes,
                    used_bytes: 0,
                    replicas: HashMap::new(),
                },
            );
            Ok(EnginePoolState {
                id: pool.clone(),
                capacity_bytes,
                used_bytes: 0,
            })
        })
    }

    async fn destroy_pool(&self, node: &NodeId, pool: &PoolId) -> Result<()> {
        self.with_node_mut(node, |_, n| {
            let p = n
                .pools
                .get(pool)
                .ok_or_else(|| Error::not_found("pool", pool))?;
            if !p.replicas.is_empty() {
                return Err(Error::ResourceInUse {
                    kind: "pool".into(),
                    id: pool.to_string(),
                    reason: format!("{} replica(s) present", p.replicas.len()),
                });
            }
            n.pools.remove(pool);
            Ok(())
        })
    }

    async fn create_replica(
        &self,
        node: &NodeId,
        pool: &PoolId,
        replica: &ReplicaId,
        size_bytes: u64,
        thin: bool,
    ) -> Result<String> {
        self.with_node_mut(node, |exports, n| {
            let host = host_of(&n.endpoint).to_string();
            let p = n
                .pools
                .get_mut(pool)
                .ok_or_else(|| Error::not_found("pool", pool))?;
            if p.replicas.contains_key(replica) {
                return Err(Error::AlreadyExists {
                    kind: "replica".into(),
                    id: replica.to_string(),
                });
            }
            let reserved = if thin { 0 } else { size_bytes };
            if p.used_bytes + reserved > p.capacity_bytes {
                return Err(Error::InsufficientCapacity {
                    requested: reserved,
                    available: p.capacity_bytes - p.used_bytes,
                });
            }
            let uri = format!("nvmf://{}:8420/{}", host, replica);
            p.used_bytes += reserved;
            p.replicas.insert(
                *replica,
                EmReplica {
                    size_bytes,
                    thin,
                    uri: uri.clone(),
                },
            );
            exports.insert(uri.clone(), node.clone());
            trace!(node = %node, replica = %replica, %uri, "replica created");
            Ok(uri)
        })
    }

    async fn destroy_replica(
        &self,
        node: &NodeId,
        pool: &PoolId,
        replica: &ReplicaId,
    ) -> Result<()> {
        self.with_node_mut(node, |exports, n| {
            let p = n
                .pools
                .get_mut(pool)
                .ok_or_else(|| Error::not_found("pool", pool))?;
            let r = p
                .replicas
                .remove(replica)
                .ok_or_else(|| Error::not_found("replica", replica))?;
            if !r.thin {
                p.used_bytes = p.used_bytes.saturating_sub(r.size_bytes);
            }
            exports.remove(&r.uri);
            Ok(())
        })
    }

    async fn create_nexus(
        &self,
        node: &NodeId,
        nexus: &NexusId,
        volume: &VolumeId,
        _size_bytes: u64,
        children: &[String],
    ) -> Result<()> {
        self.with_node_mut(node, |_, n| {
            if n.nexuses.contains_key(nexus) {
                return Err(Error::AlreadyExists {
                    kind: "nexus".into(),
                    id: nexus.to_string(),
                });
            }
            let now = Instant::now();
            n.nexuses.insert(
                *nexus,
                EmNexus {
                    children: children
                        .iter()
                        .map(|uri| EmChild {
                            uri: uri.clone(),
                            state: ChildState::Online,
                            added_at: now,
                        })
                        .collect(),
                    nqn: None,
                    device_uri: None,
                    shared_at: None,
                    shutdown: false,
                },
            );
            trace!(node = %node, nexus = %nexus, volume = %volume, "nexus created");
            Ok(())
        })
    }

    async fn add_child(&self, node: &NodeId, nexus: &NexusId, uri: &str) -> Result<()> {
        self.with_node_mut(node, |_, n| {
            let nx = n
                .nexuses
                .get_mut(nexus)
                .ok_or_else(|| Error::not_found("nexus", nexus))?;
            if nx.children.iter().any(|c| c.uri == uri) {
                return Err(Error::AlreadyExists {
                    kind: "child".into(),
                    id: uri.to_string(),
                });
            }
            nx.children.push(EmChild {
                uri: uri.to_string(),
                state: ChildState::Degraded,
                added_at: Instant::now(),
            });
            Ok(())
        })
    }

    async fn remove_child(&self, node: &NodeId, nexus: &NexusId, uri: &str) -> Result<()> {
        self.with_node_mut(node, |_, n| {
            let nx = n
                .nexuses
                .get_mut(nexus)
                .ok_or_else(|| Error::not_found("nexus", nexus))?;
            let before = nx.children.len();
            nx.children.retain(|c| c.uri != uri);
            if nx.children.len() == before {
                return Err(Error::not_found("child", uri));
            }
            Ok(())
        })
    }

    async fn share_nexus(&self, node: &NodeId, nexus: &NexusId, nqn: &str) -> Result<String> {
        self.with_node_mut(node, |_, n| {
            let host = host_of(&n.endpoint).to_string();
            let nx = n
                .nexuses
                .get_mut(nexus)
                .ok_or_else(|| Error::not_found("nexus", nexus))?;
            if let (Some(existing), Some(uri)) = (&nx.nqn, &nx.device_uri) {
                if existing == nqn {
                    return Ok(uri.clone());
                }
            }
            let device_uri = format!("nvmf://{}/{}", host, nqn);
            nx.nqn = Some(nqn.to_string());
            nx.device_uri = Some(device_uri.clone());
            nx.shared_at = Some(Instant::now());
            Ok(device_uri)
        })
    }

    async fn shutdown_nexus(&self, node: &NodeId, nexus: &NexusId) -> Result<()> {
        self.with_node_mut(node, |_, n| {
            let nx = n
                .nexuses
                .get_mut(nexus)
                .ok_or_else(|| Error::not_found("nexus", nexus))?;
            nx.shutdown = true;
            Ok(())
        })
    }

    async fn destroy_nexus(&self, node: &NodeId, nexus: &NexusId) -> Result<()> {
        self.with_node_mut(node, |_, n| {
            n.nexuses
                .remove(nexus)
                .map(|_| ())
                .ok_or_else(|| Error::not_found("nexus", nexus))
        })
    }

    async fn node_state(&self, node: &NodeId) -> Result<EngineNodeState> {
        self.with_node(node, |inner, n| {
            let pools = n
                .pools
                .iter()
                .map(|(id, p)| EnginePoolState {
                    id: id.clone(),
                    capacity_bytes: p.capacity_bytes,
                    used_bytes: p.used_bytes,
                })
                .collect();
            let replicas = n
                .pools
                .iter()
                .flat_map(|(pool_id, p)| {
                    p.replicas.iter().map(|(id, r)| EngineReplicaState {
                        id: *id,
                        pool: pool_id.clone(),
                        uri: r.uri.clone(),
                    })
                })
                .collect();
            let nexuses = n
                .nexuses
                .iter()
                .map(|(id, nx)| EngineNexusState {
                    id: *id,
                    children: nx
                        .children
                        .iter()
                        .map(|c| EngineChildState {
                            uri: c.uri.clone(),
                            state: self.child_view(inner, c),
                        })
                        .collect(),
                    device_uri: nx.device_uri.clone(),
                    host_connected: nx
                        .shared_at
                        .map(|t| t.elapsed() >= self.connect_delay)
                        .unwrap_or(false),
                    shutdown: nx.shutdown,
                })
                .collect();
            Ok(EngineNodeState {
                node: node.clone(),
                pools,
                replicas,
                nexuses,
            })
        })
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Capacity encoded in a disk URI, e.g. `malloc:///disk0?size_mb=100`
fn disk_capacity(disk: &str) -> u64 {
    disk.split_once("size_mb=")
        .and_then(|(_, rest)| {
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<u64>().ok()
        })
        .map(|mb| mb * 1024 * 1024)
        .unwrap_or(DEFAULT_DISK_CAPACITY)
}

fn host_of(endpoint: &str) -> &str {
    match endpoint.split_once(':') {
        Some((host, _)) => host,
        None => endpoint,
    }
}

/// Spawn the heartbeat pump feeding the node registry
///
/// Every alive engine node heartbeats once per `interval`; a killed node
/// simply stops, which is what the registry watchdog keys off.
pub fn spawn_heartbeat_pump(
    engine: Arc<InProcessEngine>,
    nodes: Arc<NodeRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for node in engine.alive_nodes() {
                        if let Err(err) = nodes.heartbeat(&node) {
                            trace!(node = %node, %err, "heartbeat skipped");
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn engine_with_pool() -> (Arc<InProcessEngine>, NodeId, PoolId) {
        let engine = InProcessEngine::new();
        engine.add_node("io-engine-1", "10.1.0.5:10124");
        (engine, NodeId::from("io-engine-1"), PoolId::from("pool-1"))
    }

    #[tokio::test]
    async fn test_pool_capacity_from_disk_uri() {
        let (engine, node, pool) = engine_with_pool();
        let state = engine
            .create_pool(&node, &pool, &["malloc:///disk0?size_mb=64".into()])
            .await
            .unwrap();
        assert_eq!(state.capacity_bytes, 64 * 1024 * 1024);

        // unknown encoding falls back to the default
        let state = engine
            .create_pool(&node, &PoolId::from("pool-2"), &["aio:///dev/sdb".into()])
            .await
            .unwrap();
        assert_eq!(state.capacity_bytes, DEFAULT_DISK_CAPACITY);
    }

    #[tokio::test]
    async fn test_replica_accounting_and_capacity() {
        let (engine, node, pool) = engine_with_pool();
        engine
            .create_pool(&node, &pool, &["malloc:///disk0?size_mb=100".into()])
            .await
            .unwrap();

        let r1 = ReplicaId::new_random();
        let uri = engine
            .create_replica(&node, &pool, &r1, 60 * 1024 * 1024, false)
            .await
            .unwrap();
        assert!(uri.starts_with("nvmf://10.1.0.5:8420/"));

        // second thick replica does not fit
        let r2 = ReplicaId::new_random();
        let err = engine
            .create_replica(&node, &pool, &r2, 60 * 1024 * 1024, false)
            .await
            .unwrap_err();
        assert_matches!(err, Error::InsufficientCapacity { .. });

        engine.destroy_replica(&node, &pool, &r1).await.unwrap();
        let state = engine.node_state(&node).await.unwrap();
        assert_eq!(state.pools[0].used_bytes, 0);
        assert!(state.replicas.is_empty());
    }

    #[tokio::test]
    async fn test_killed_node_is_unreachable_and_revives() {
        let (engine, node, pool) = engine_with_pool();
        engine
            .create_pool(&node, &pool, &["malloc:///disk0?size_mb=100".into()])
            .await
            .unwrap();

        assert!(engine.kill_node(&node));
        assert!(!engine.kill_node(&node));
        let err = engine.node_state(&node).await.unwrap_err();
        assert_matches!(err, Error::NodeUnreachable { .. });

        // state survives the restart
        assert!(engine.revive_node(&node));
        let state = engine.node_state(&node).await.unwrap();
        assert_eq!(state.pools.len(), 1);
    }

    #[tokio::test]
    async fn test_child_faults_when_exporter_dies() {
        let engine = InProcessEngine::new();
        engine.add_node("io-engine-1", "10.1.0.5:10124");
        engine.add_node("io-engine-2", "10.1.0.6:10124");
        let n1 = NodeId::from("io-engine-1");
        let n2 = NodeId::from("io-engine-2");
        let pool = PoolId::from("pool-1");

        engine
            .create_pool(&n2, &pool, &["malloc:///disk0?size_mb=100".into()])
            .await
            .unwrap();
        let replica = ReplicaId::new_random();
        let uri = engine
            .create_replica(&n2, &pool, &replica, 10 * 1024 * 1024, false)
            .await
            .unwrap();

        let nexus = NexusId::new_random();
        let volume = VolumeId::new_random();
        engine
            .create_nexus(&n1, &nexus, &volume, 10 * 1024 * 1024, &[uri.clone()])
            .await
            .unwrap();

        let state = engine.node_state(&n1).await.unwrap();
        assert_eq!(state.nexuses[0].children[0].state, ChildState::Online);

        engine.kill_node(&n2);
        let state = engine.node_state(&n1).await.unwrap();
        assert_eq!(state.nexuses[0].children[0].state, ChildState::Faulted);

        engine.revive_node(&n2);
        let state = engine.node_state(&n1).await.unwrap();
        assert_eq!(state.nexuses[0].children[0].state, ChildState::Online);
    }

    #[tokio::test]
    async fn test_added_child_rebuilds_then_share_connects() {
        let (engine, node, pool) = engine_with_pool();
        engine
            .create_pool(&node, &pool, &["malloc:///disk0?size_mb=100".into()])
            .await
            .unwrap();
        let r1 = ReplicaId::new_random();
        let r2 = ReplicaId::new_random();
        let uri1 = engine
            .create_replica(&node, &pool, &r1, 10 * 1024 * 1024, false)
            .await
            .unwrap();
        let uri2 = engine
            .create_replica(&node, &pool, &r2, 10 * 1024 * 1024, false)
            .await
            .unwrap();

        let nexus = NexusId::new_random();
        let volume = VolumeId::new_random();
        engine
            .create_nexus(&node, &nexus, &volume, 10 * 1024 * 1024, &[uri1])
            .await
            .unwrap();
        engine.add_child(&node, &nexus, &uri2).await.unwrap();

        // zero rebuild delay: degraded child reports online immediately
        let state = engine.node_state(&node).await.unwrap();
        let child = state.nexuses[0]
            .children
            .iter()
            .find(|c| c.uri == uri2)
            .unwrap();
        assert_eq!(child.state, ChildState::Online);

        let nqn = format!("nqn.2019-05.io.blockplane:{}", volume);
        let device = engine.share_nexus(&node, &nexus, &nqn).await.unwrap();
        assert_eq!(device, format!("nvmf://10.1.0.5/{}", nqn));
        // sharing twice with the same nqn is idempotent
        let again = engine.share_nexus(&node, &nexus, &nqn).await.unwrap();
        assert_eq!(again, device);

        let state = engine.node_state(&node).await.unwrap();
        assert!(state.nexuses[0].host_connected);
    }

    #[tokio::test]
    async fn test_heartbeat_pump_feeds_registry() {
        let (tx, _) = tokio::sync::broadcast::channel(64);
        let nodes = NodeRegistry::new(tx);
        let engine = InProcessEngine::new();
        engine.add_node("io-engine-1", "10.1.0.5:10124");
        nodes.register("io-engine-1", "10.1.0.5:10124").unwrap();

        let cancel = CancellationToken::new();
        let pump = spawn_heartbeat_pump(
            engine.clone(),
            nodes.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let _ = pump.await;

        assert!(nodes.stats().heartbeats >= 2);
    }
}
