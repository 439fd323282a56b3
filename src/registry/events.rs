//! Registry Events
//!
//! Events emitted by the registry for external consumers to react to node
//! liveness and resource lifecycle changes. The reconciler's liveness path
//! hangs off `NodeWentOffline`.

use serde::{Deserialize, Serialize};

use crate::resources::{NexusId, NodeId, PathState, PoolId, ReplicaId, VolumeId};

/// Events emitted by the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistryEvent {
    /// A new node was registered
    NodeRegistered { node_id: NodeId, endpoint: String },

    /// A node was deregistered
    NodeDeregistered { node_id: NodeId },

    /// A node went offline (missed heartbeats)
    NodeWentOffline { node_id: NodeId },

    /// A node came back online
    NodeCameOnline { node_id: NodeId },

    /// A pool was created on a node
    PoolCreated {
        pool_id: PoolId,
        node_id: NodeId,
        capacity_bytes: u64,
    },

    /// A pool was deleted
    PoolDeleted { pool_id: PoolId, node_id: NodeId },

    /// A volume spec was created
    VolumeCreated { volume: VolumeId, num_replicas: u8 },

    /// A volume and its resources are gone
    VolumeDeleted { volume: VolumeId },

    /// A replica was created for a volume
    ReplicaCreated {
        replica: ReplicaId,
        volume: VolumeId,
        pool_id: PoolId,
    },

    /// A replica was destroyed or disowned
    ReplicaDestroyed { replica: ReplicaId },

    /// A nexus child went faulted
    ChildFaulted {
        nexus: NexusId,
        volume: VolumeId,
        replica: ReplicaId,
    },

    /// A volume was published or republished
    TargetPublished {
        volume: VolumeId,
        node_id: NodeId,
        device_uri: String,
    },

    /// A volume was unpublished
    TargetUnpublished { volume: VolumeId },

    /// A path changed host-side state
    PathStateChanged {
        volume: VolumeId,
        node_id: NodeId,
        state: PathState,
    },
}

impl RegistryEvent {
    /// Get the node ID associated with this event, if any
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            RegistryEvent::NodeRegistered { node_id, .. } => Some(node_id),
            RegistryEvent::NodeDeregistered { node_id } => Some(node_id),
            RegistryEvent::NodeWentOffline { node_id } => Some(node_id),
            RegistryEvent::NodeCameOnline { node_id } => Some(node_id),
            RegistryEvent::PoolCreated { node_id, .. } => Some(node_id),
            RegistryEvent::PoolDeleted { node_id, .. } => Some(node_id),
            RegistryEvent::TargetPublished { node_id, .. } => Some(node_id),
            RegistryEvent::PathStateChanged { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    /// Get the volume this event concerns, if any
    pub fn volume(&self) -> Option<&VolumeId> {
        match self {
            RegistryEvent::VolumeCreated { volume, .. } => Some(volume),
            RegistryEvent::VolumeDeleted { volume } => Some(volume),
            RegistryEvent::ReplicaCreated { volume, .. } => Some(volume),
            RegistryEvent::ChildFaulted { volume, .. } => Some(volume),
            RegistryEvent::TargetPublished { volume, .. } => Some(volume),
            RegistryEvent::TargetUnpublished { volume } => Some(volume),
            RegistryEvent::PathStateChanged { volume, .. } => Some(volume),
            _ => None,
        }
    }

    /// Check if this is a node liveness transition
    pub fn is_liveness_event(&self) -> bool {
        matches!(
            self,
            RegistryEvent::NodeWentOffline { .. } | RegistryEvent::NodeCameOnline { .. }
        )
    }
}
