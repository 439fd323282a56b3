//! Nexus model
//!
//! A nexus is the fan-out point of the I/O path: one per published volume
//! target, mirroring writes to its children (one child per replica). Child
//! health drives both nexus status and volume status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{NexusId, NodeId, ReplicaId, VolumeId};

/// Health of a single nexus child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildState {
    /// In sync, serving I/O
    Online,
    /// Attached but rebuilding
    Degraded,
    /// Out of the I/O path
    Faulted,
}

impl std::fmt::Display for ChildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChildState::Online => write!(f, "online"),
            ChildState::Degraded => write!(f, "degraded"),
            ChildState::Faulted => write!(f, "faulted"),
        }
    }
}

/// One child of a nexus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Child {
    /// Replica backing this child
    pub replica: ReplicaId,
    /// Child address, the replica's share URI
    pub uri: String,
    /// Current health
    pub state: ChildState,
    /// When the child last went Faulted; starts the eviction grace clock
    pub faulted_at: Option<DateTime<Utc>>,
}

impl Child {
    pub fn new(replica: ReplicaId, uri: impl Into<String>, state: ChildState) -> Self {
        Self {
            replica,
            uri: uri.into(),
            state,
            faulted_at: None,
        }
    }

    /// Transition child health, stamping `faulted_at` on entry to Faulted
    pub fn set_state(&mut self, state: ChildState, now: DateTime<Utc>) {
        if state == ChildState::Faulted && self.state != ChildState::Faulted {
            self.faulted_at = Some(now);
        }
        if state != ChildState::Faulted {
            self.faulted_at = None;
        }
        self.state = state;
    }
}

/// Aggregate nexus health, derived from the children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NexusStatus {
    /// At least one child online, all children online
    Online,
    /// At least one child online, some child not online
    Degraded,
    /// No child online
    Faulted,
    /// Retired by a republish, awaiting destroy
    Shutdown,
}

impl std::fmt::Display for NexusStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NexusStatus::Online => write!(f, "online"),
            NexusStatus::Degraded => write!(f, "degraded"),
            NexusStatus::Faulted => write!(f, "faulted"),
            NexusStatus::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// A nexus instance on a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nexus {
    /// Nexus ID
    pub id: NexusId,
    /// Volume this nexus fronts
    pub volume: VolumeId,
    /// Hosting node
    pub node: NodeId,
    /// Children, one per attached replica
    pub children: Vec<Child>,
    /// Set when the nexus was retired by a republish
    pub shutdown: bool,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Nexus {
    /// Aggregate status: Online iff every child is Online, Faulted once no
    /// child is Online, Shutdown overrides everything
    pub fn status(&self) -> NexusStatus {
        if self.shutdown {
            return NexusStatus::Shutdown;
        }
        let online = self
            .children
            .iter()
            .filter(|c| c.state == ChildState::Online)
            .count();
        if online == 0 {
            NexusStatus::Faulted
        } else if online == self.children.len() {
            NexusStatus::Online
        } else {
            NexusStatus::Degraded
        }
    }

    pub fn child(&self, replica: &ReplicaId) -> Option<&Child> {
        self.children.iter().find(|c| &c.replica == replica)
    }

    pub fn child_mut(&mut self, replica: &ReplicaId) -> Option<&mut Child> {
        self.children.iter_mut().find(|c| &c.replica == replica)
    }

    pub fn online_children(&self) -> usize {
        self.children
            .iter()
            .filter(|c| c.state == ChildState::Online)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nexus_with(states: &[ChildState]) -> Nexus {
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

    #[test]
    fn test_status_aggregation() {
        use ChildState::*;
        assert_eq!(nexus_with(&[Online, Online]).status(), NexusStatus::Online);
        assert_eq!(
            nexus_with(&[Online, Degraded]).status(),
            NexusStatus::Degraded
        );
        assert_eq!(
            nexus_with(&[Online, Faulted]).status(),
            NexusStatus::Degraded
        );
        assert_eq!(
            nexus_with(&[Faulted, Faulted]).status(),
            NexusStatus::Faulted
        );
        assert_eq!(
            nexus_with(&[Degraded, Faulted]).status(),
            NexusStatus::Faulted
        );
        assert_eq!(nexus_with(&[]).status(), NexusStatus::Faulted);
    }

    #[test]
    fn test_shutdown_overrides_children() {
        let mut nexus = nexus_with(&[ChildState::Online]);
        nexus.shutdown = true;
        assert_eq!(nexus.status(), NexusStatus::Shutdown);
    }

    #[test]
    fn test_faulted_at_stamped_once() {
        let mut child = Child::new(ReplicaId::new_random(), "bdev:///r", ChildState::Online);
        let t0 = Utc::now();
        child.set_state(ChildState::Faulted, t0);
        assert_eq!(child.faulted_at, Some(t0));

        // a second fault report must not restart the grace clock
        let t1 = t0 + chrono::Duration::seconds(5);
        child.set_state(ChildState::Faulted, t1);
        assert_eq!(child.faulted_at, Some(t0));

        child.set_state(ChildState::Online, t1);
        assert_eq!(child.faulted_at, None);
    }
}
