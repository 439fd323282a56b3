//! Engine Ports - trait seam between the control plane and io-engines
//!
//! The control plane never talks to a storage node directly; every data-plane
//! mutation and every observed-state fetch goes through [`IoEngineApi`]. The
//! in-process implementation in [`inproc`] emulates a cluster of engines so
//! the binary and the test suite run standalone.

pub mod inproc;

pub use inproc::InProcessEngine;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::resources::{ChildState, NexusId, NodeId, PoolId, ReplicaId, VolumeId};

// =============================================================================
// Observed engine state
// =============================================================================

/// Pool as reported by an engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnginePoolState {
    pub id: PoolId,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
}

/// Replica as reported by an engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineReplicaState {
    pub id: ReplicaId,
    pub pool: PoolId,
    /// Share URI remote nexuses dial
    pub uri: String,
}

/// One nexus child as reported by an engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineChildState {
    pub uri: String,
    pub state: ChildState,
}

/// Nexus as reported by an engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineNexusState {
    pub id: NexusId,
    pub children: Vec<EngineChildState>,
    /// Device URI once shared
    pub device_uri: Option<String>,
    /// Whether a host completed the fabric connect to this target
    pub host_connected: bool,
    pub shutdown: bool,
}

/// Everything one engine reports about itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineNodeState {
    pub node: NodeId,
    pub pools: Vec<EnginePoolState>,
    pub replicas: Vec<EngineReplicaState>,
    pub nexuses: Vec<EngineNexusState>,
}

// =============================================================================
// IoEngine Port
// =============================================================================

/// Port for io-engine operations
///
/// Every call targets one node and fails `NodeUnreachable` when that node is
/// down. Calls are expected to be wrapped in the configured node timeout by
/// the caller.
#[async_trait]
pub trait IoEngineApi: Send + Sync {
    /// Create a pool from disk URIs
    async fn create_pool(
        &self,
        node: &NodeId,
        pool: &PoolId,
        disks: &[String],
    ) -> Result<EnginePoolState>;

    /// Destroy a pool
    async fn destroy_pool(&self, node: &NodeId, pool: &PoolId) -> Result<()>;

    /// Create a replica on a pool, returning its share URI
    async fn create_replica(
        &self,
        node: &NodeId,
        pool: &PoolId,
        replica: &ReplicaId,
        size_bytes: u64,
        thin: bool,
    ) -> Result<String>;

    /// Destroy a replica
    async fn destroy_replica(&self, node: &NodeId, pool: &PoolId, replica: &ReplicaId)
        -> Result<()>;

    /// Create a nexus over the given child URIs
    async fn create_nexus(
        &self,
        node: &NodeId,
        nexus: &NexusId,
        volume: &VolumeId,
        size_bytes: u64,
        children: &[String],
    ) -> Result<()>;

    /// Attach a child to a live nexus; the child starts rebuilding
    async fn add_child(&self, node: &NodeId, nexus: &NexusId, uri: &str) -> Result<()>;

    /// Detach a child from a live nexus
    async fn remove_child(&self, node: &NodeId, nexus: &NexusId, uri: &str) -> Result<()>;

    /// Expose a nexus over NVMe-oF under the given NQN, returning the device URI
    async fn share_nexus(&self, node: &NodeId, nexus: &NexusId, nqn: &str) -> Result<String>;

    /// Quiesce a nexus without destroying it; its target stops accepting I/O
    async fn shutdown_nexus(&self, node: &NodeId, nexus: &NexusId) -> Result<()>;

    /// Destroy a nexus
    async fn destroy_nexus(&self, node: &NodeId, nexus: &NexusId) -> Result<()>;

    /// Fetch everything the engine on `node` reports
    async fn node_state(&self, node: &NodeId) -> Result<EngineNodeState>;
}

pub type IoEngineRef = Arc<dyn IoEngineApi>;
