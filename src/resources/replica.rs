//! Replica model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{NodeId, PoolId, ReplicaId, VolumeId};

/// A single copy of a volume's data, bound to one pool
///
/// Replica size is fixed at creation. `owner` goes to None when the replica
/// is disowned (its node was unreachable at destroy time); disowned replicas
/// are garbage collected if the node returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replica {
    /// Replica ID
    pub id: ReplicaId,
    /// Owning volume, None once disowned
    pub owner: Option<VolumeId>,
    /// Pool the replica lives on
    pub pool: PoolId,
    /// Node hosting that pool
    pub node: NodeId,
    /// Size in bytes, immutable
    pub size_bytes: u64,
    /// Thin provisioned, no capacity reserved up front
    pub thin: bool,
    /// Share URI used as a nexus child address
    pub uri: String,
    /// Creation timestamp, drives oldest-first removal
    pub created_at: DateTime<Utc>,
}

impl Replica {
    pub fn is_owned_by(&self, volume: &VolumeId) -> bool {
        self.owner.as_ref() == Some(volume)
    }
}
