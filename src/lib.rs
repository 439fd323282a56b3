//! Blockplane - Volume Control Plane
//!
//! A control plane for replicated block volumes. It places replicas on
//! io-engine pools, assembles them into NVMe-oF targets, and continuously
//! reconciles observed engine state onto declared volume specs.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Volume Control Plane                       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────┐  │
//! │  │    REST API     │  │     Volume      │  │      State      │  │
//! │  │     (axum)      │  │   Reconciler    │  │     Poller      │  │
//! │  └────────┬────────┘  └────────┬────────┘  └────────┬────────┘  │
//! │           │                    │                    │           │
//! │           └────────────────────┼────────────────────┘           │
//! │                                │                                │
//! │               ┌────────────────┴────────────────┐               │
//! │               │  Registry (nodes + resources)   │               │
//! │               │ specs, observed state, io paths │               │
//! │               └────────────────┬────────────────┘               │
//! │                                │                                │
//! │               ┌────────────────┴────────────────┐               │
//! │               │        IoEngineApi seam         │               │
//! │               └─────────────────────────────────┘               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                       io-engine data plane                      │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────┐  │
//! │  │      Pools      │  │    Replicas     │  │ Nexus (NVMe-oF) │  │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`api`]: REST API server and handlers
//! - [`config`]: Control-plane timing configuration
//! - [`control`]: Placement, replica/nexus lifecycle, publishing, reconciliation
//! - [`engine`]: The io-engine port and its in-process implementation
//! - [`error`]: Error types and handling
//! - [`registry`]: Node liveness and resource state stores
//! - [`resources`]: Core resource types

pub mod api;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod registry;
pub mod resources;

// Re-export commonly used types
pub use api::{ApiServer, ApiServerConfig, RestRouter};

pub use config::ControlPlaneConfig;

pub use control::{
    NexusManager, PlacementEngine, PoolService, ReplicaManager, StatePoller,
    TargetPublisher, VolumeReconciler, VolumeService,
};

pub use engine::{
    EngineNodeState, InProcessEngine, IoEngineApi, IoEngineRef,
    inproc::spawn_heartbeat_pump,
};

pub use error::{Error, ErrorAction, Result};

pub use registry::{
    NodeRegistry, NodeStatsSnapshot, Registry, RegistryEvent,
    ResourceRegistry, ResourceStatsSnapshot,
};

pub use resources::{
    Child, ChildState, Nexus, NexusId, NexusStatus,
    Node, NodeId, NodeStatus,
    Path, PathState, Pool, PoolId, PoolStatus,
    Replica, ReplicaId,
    Protocol, Volume, VolumeId, VolumePolicy, VolumeSpec, VolumeState, VolumeStatus,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
