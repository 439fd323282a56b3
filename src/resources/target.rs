//! Target path model
//!
//! One path per (volume, nexus): the host-visible I/O route to a target.
//! During a republish two paths coexist on distinct node addresses, the old
//! one live and the new one connecting, which is what lets clients fail over
//! without ever being pathless.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{NexusId, NodeId, VolumeId};

/// NQN prefix shared by every volume subsystem
pub const NQN_PREFIX: &str = "nqn.2019-05.io.blockplane";

/// Host-side state of one path to a volume target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathState {
    /// Announced, host has not completed the fabric connect
    Connecting,
    /// Carrying I/O
    Live,
    /// Went away without a clean removal
    Lost,
}

impl std::fmt::Display for PathState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathState::Connecting => write!(f, "connecting"),
            PathState::Live => write!(f, "live"),
            PathState::Lost => write!(f, "lost"),
        }
    }
}

/// One route from hosts to a volume target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Path {
    /// Volume the path belongs to
    pub volume: VolumeId,
    /// Nexus behind the path
    pub nexus: NexusId,
    /// Node hosting the nexus
    pub node: NodeId,
    /// Node address the host dials
    pub address: String,
    /// Full device URI
    pub device_uri: String,
    /// Host-side state
    pub state: PathState,
    /// When the path was announced
    pub created_at: DateTime<Utc>,
}

/// Subsystem NQN for a volume; stable across republishes so all paths land
/// in one ANA subsystem
pub fn volume_nqn(volume: &VolumeId) -> String {
    format!("{}:{}", NQN_PREFIX, volume)
}

/// Device URI for a volume target on a given node address
pub fn device_uri(address: &str, volume: &VolumeId) -> String {
    format!("nvmf://{}/{}", address, volume_nqn(volume))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nqn_stable_uri_differs_by_address() {
        let volume = VolumeId::new_random();
        let a = device_uri("10.1.0.5", &volume);
        let b = device_uri("10.1.0.6", &volume);
        assert_ne!(a, b);
        assert!(a.ends_with(&volume_nqn(&volume)));
        assert!(b.ends_with(&volume_nqn(&volume)));
        assert!(a.starts_with("nvmf://10.1.0.5/"));
    }
}
