//! Control Plane
//!
//! Volume orchestration over the registry and the engine seam: placement,
//! replica and nexus lifecycle, target publishing, the state poller, and
//! the reconciler that converges observed state onto volume specs.

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::resources::NodeId;

pub mod nexus;
pub mod placement;
pub mod poller;
pub mod pools;
pub mod publisher;
pub mod reconciler;
pub mod replicas;
pub mod volumes;

pub use nexus::NexusManager;
pub use placement::{PlacementEngine, PlacementResult, PoolCandidate};
pub use poller::StatePoller;
pub use pools::PoolService;
pub use publisher::TargetPublisher;
pub use reconciler::VolumeReconciler;
pub use replicas::ReplicaManager;
pub use volumes::VolumeService;

/// Bound an engine call by the node connect timeout
///
/// A call that does not complete in time is reported as the node being
/// unreachable, which requeues with backoff like any other liveness failure.
pub(crate) async fn bounded<T, F>(node: &NodeId, limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::NodeUnreachable {
            node_id: node.to_string(),
        }),
    }
}
