//! Volume model
//!
//! The volume spec is the desired state written through the API; the volume
//! state is assembled on read from the registry's observed resources. The
//! reconciler's whole job is driving the second toward the first.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::nexus::{ChildState, Nexus, NexusStatus};
use super::{NexusId, NodeId, PoolId, ReplicaId, VolumeId};
use crate::error::Error;

/// Share protocol for published volumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Nvmf,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Nvmf => write!(f, "nvmf"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nvmf" => Ok(Protocol::Nvmf),
            other => Err(Error::ApiValidation(format!(
                "unsupported protocol: {}",
                other
            ))),
        }
    }
}

/// Per-volume behavior knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumePolicy {
    /// Replace faulted children automatically after the grace period
    #[serde(default = "VolumePolicy::default_self_heal")]
    pub self_heal: bool,
}

impl VolumePolicy {
    fn default_self_heal() -> bool {
        true
    }
}

impl Default for VolumePolicy {
    fn default() -> Self {
        Self {
            self_heal: Self::default_self_heal(),
        }
    }
}

/// Where a volume is published
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Node hosting the target nexus
    pub node: NodeId,
    /// Share protocol
    pub protocol: Protocol,
    /// Nexus serving as the target
    pub nexus: NexusId,
    /// Device URI handed to the client
    pub device_uri: String,
}

/// Desired state of a volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Volume ID
    pub uuid: VolumeId,
    /// Size in bytes
    pub size_bytes: u64,
    /// Desired replica count
    pub num_replicas: u8,
    /// Thin provisioning
    pub thin: bool,
    /// Behavior knobs
    pub policy: VolumePolicy,
    /// Set while published
    pub target_config: Option<TargetConfig>,
    /// Delete intent, drives teardown in the reconciler
    pub deleting: bool,
}

impl VolumeSpec {
    pub fn is_published(&self) -> bool {
        self.target_config.is_some()
    }
}

/// Overall volume health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeStatus {
    /// Published but target state not observable
    Unknown,
    Online,
    Degraded,
    Faulted,
}

impl std::fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeStatus::Unknown => write!(f, "unknown"),
            VolumeStatus::Online => write!(f, "online"),
            VolumeStatus::Degraded => write!(f, "degraded"),
            VolumeStatus::Faulted => write!(f, "faulted"),
        }
    }
}

/// Observed placement and health of one replica
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaTopology {
    pub node: NodeId,
    pub pool: PoolId,
    pub state: ChildState,
}

/// Observed state of a volume, assembled on read
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeState {
    pub uuid: VolumeId,
    pub status: VolumeStatus,
    pub size_bytes: u64,
    /// Target view when published
    pub target: Option<TargetConfig>,
    /// Health and placement per replica
    pub replica_topology: BTreeMap<ReplicaId, ReplicaTopology>,
    /// Standing convergence failure, such as a placement shortfall or a
    /// path stuck connecting, retried every reconcile cycle
    pub shortfall: Option<String>,
}

/// A volume as returned by the API: desired plus observed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub spec: VolumeSpec,
    pub state: VolumeState,
}

/// Derive volume health from the target nexus and the replica topology
///
/// Published: the nexus decides, except that a healthy nexus with fewer
/// children than desired replicas is only Degraded. A published volume whose
/// nexus cannot be observed is Unknown. Unpublished: replica presence and
/// health decide.
pub fn derive_status(
    spec: &VolumeSpec,
    target_nexus: Option<&Nexus>,
    topology: &BTreeMap<ReplicaId, ReplicaTopology>,
) -> VolumeStatus {
    if spec.is_published() {
        return match target_nexus {
            None => VolumeStatus::Unknown,
            Some(nexus) => match nexus.status() {
                NexusStatus::Online => {
                    if nexus.children.len() == spec.num_replicas as usize {
                        VolumeStatus::Online
                    } else {
                        VolumeStatus::Degraded
                    }
                }
                NexusStatus::Degraded => VolumeStatus::Degraded,
                NexusStatus::Faulted | NexusStatus::Shutdown => VolumeStatus::Faulted,
            },
        };
    }

    let online = topology
        .values()
        .filter(|t| t.state == ChildState::Online)
        .count();
    if topology.is_empty() {
        VolumeStatus::Faulted
    } else if online >= spec.num_replicas as usize {
        VolumeStatus::Online
    } else {
        VolumeStatus::Degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::nexus::Child;
    use chrono::Utc;

    fn spec(num_replicas: u8, published: bool) -> VolumeSpec {
        VolumeSpec {
            uuid: VolumeId::new_random(),
            size_bytes: 50 * 1024 * 1024,
            num_replicas,
            thin: false,
            policy: VolumePolicy::default(),
            target_config: published.then(|| TargetConfig {
                node: NodeId::from("io-engine-1"),
                protocol: Protocol::Nvmf,
                nexus: NexusId::new_random(),
                device_uri: "nvmf://10.1.0.5/nqn.2019-05.io.blockplane:v".into(),
            }),
            deleting: false,
        }
    }

    fn nexus(states: &[ChildState]) -> Nexus {
        Nexus {
            id: NexusId::new_random(),
            volume: VolumeId::new_random(),
            node: NodeId::from("io-engine-1"),
            children: states
                .iter()
                .map(|s| Child::new(ReplicaId::new_random(), "bdev:///r", *s))
                .collect(),
            shutdown: false,
            created_at: Utc::now(),
        }
    }

    fn topology(states: &[ChildState]) -> BTreeMap<ReplicaId, ReplicaTopology> {
        states
            .iter()
            .map(|s| {
                (
                    ReplicaId::new_random(),
                    ReplicaTopology {
                        node: NodeId::from("io-engine-1"),
                        pool: PoolId::from("pool-1"),
                        state: *s,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_published_status_follows_nexus() {
        use ChildState::*;
        let spec = spec(2, true);
        assert_eq!(
            derive_status(&spec, Some(&nexus(&[Online, Online])), &topology(&[])),
            VolumeStatus::Online
        );
        assert_eq!(
            derive_status(&spec, Some(&nexus(&[Online, Faulted])), &topology(&[])),
            VolumeStatus::Degraded
        );
        assert_eq!(
            derive_status(&spec, Some(&nexus(&[Faulted, Faulted])), &topology(&[])),
            VolumeStatus::Faulted
        );
        // healthy nexus, but running below the desired replica count
        assert_eq!(
            derive_status(&spec, Some(&nexus(&[Online])), &topology(&[])),
            VolumeStatus::Degraded
        );
        // published target not observable
        assert_eq!(
            derive_status(&spec, None, &topology(&[])),
            VolumeStatus::Unknown
        );
    }

    #[test]
    fn test_unpublished_status_follows_replicas() {
        use ChildState::*;
        let spec = spec(2, false);
        assert_eq!(
            derive_status(&spec, None, &topology(&[Online, Online])),
            VolumeStatus::Online
        );
        assert_eq!(
            derive_status(&spec, None, &topology(&[Online])),
            VolumeStatus::Degraded
        );
        assert_eq!(
            derive_status(&spec, None, &topology(&[Online, Faulted])),
            VolumeStatus::Degraded
        );
        assert_eq!(
            derive_status(&spec, None, &topology(&[])),
            VolumeStatus::Faulted
        );
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!("nvmf".parse::<Protocol>().unwrap(), Protocol::Nvmf);
        assert_eq!("NVMF".parse::<Protocol>().unwrap(), Protocol::Nvmf);
        assert!("iscsi".parse::<Protocol>().is_err());
    }
}
