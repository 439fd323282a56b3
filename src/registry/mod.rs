//! Registry Module
//!
//! One event bus, two stores: the node registry for liveness and the
//! resource registry for everything the reconciler drives toward spec.

pub mod events;
pub mod nodes;
pub mod resources;

pub use events::*;
pub use nodes::*;
pub use resources::*;

use std::sync::Arc;

use tokio::sync::broadcast;

/// Capacity of the registry event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The full control-plane registry
pub struct Registry {
    pub nodes: Arc<NodeRegistry>,
    pub resources: Arc<ResourceRegistry>,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl Registry {
    /// Create the registry with a shared event bus
    pub fn new() -> Arc<Self> {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            nodes: NodeRegistry::new(event_sender.clone()),
            resources: ResourceRegistry::new(event_sender.clone()),
            event_sender,
        })
    }

    /// Get an event receiver covering both stores
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }
}
