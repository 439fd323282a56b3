//! Resource model for the control plane
//!
//! Typed identifiers and the spec/state split for every resource the
//! reconciler manages: nodes, pools, replicas, nexuses, volumes and targets.
//! Specs carry desired state written through the API; states carry what the
//! pollers last observed on the storage engines.

pub mod nexus;
pub mod node;
pub mod pool;
pub mod replica;
pub mod target;
pub mod volume;

pub use nexus::{Child, ChildState, Nexus, NexusStatus};
pub use node::{Node, NodeStatus};
pub use pool::{Pool, PoolStatus};
pub use replica::Replica;
pub use target::{volume_nqn, Path, PathState};
pub use volume::{
    derive_status, Protocol, ReplicaTopology, TargetConfig, Volume, VolumePolicy, VolumeSpec,
    VolumeState, VolumeStatus,
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// =============================================================================
// String-keyed identifiers
// =============================================================================

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<&String> for $name {
            fn from(s: &String) -> Self {
                Self(s.clone())
            }
        }
    };
}

string_id! {
    /// Unique identifier for a storage node
    NodeId
}

string_id! {
    /// Unique identifier for a pool
    PoolId
}

// =============================================================================
// UUID-keyed identifiers
// =============================================================================

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new_random() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(u: Uuid) -> Self {
                Self(u)
            }
        }

        impl std::str::FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| Error::ApiValidation(format!("invalid uuid '{}': {}", s, e)))
            }
        }
    };
}

uuid_id! {
    /// Unique identifier for a volume
    VolumeId
}

uuid_id! {
    /// Unique identifier for a replica
    ReplicaId
}

uuid_id! {
    /// Unique identifier for a nexus
    NexusId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_id_conversions() {
        let id = NodeId::from("io-engine-1");
        assert_eq!(id.as_str(), "io-engine-1");
        assert_eq!(format!("{}", id), "io-engine-1");
        assert_eq!(NodeId::new("io-engine-1"), id);
    }

    #[test]
    fn test_uuid_id_round_trip() {
        let id = VolumeId::new_random();
        let parsed: VolumeId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        let bad: Result<VolumeId, _> = "not-a-uuid".parse();
        assert!(bad.is_err());
    }
}
