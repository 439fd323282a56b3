//! Node Registry
//!
//! Tracks storage nodes and their liveness. Heartbeats arrive from the engine
//! layer; a watchdog flips nodes Offline once their heartbeat goes stale and
//! the resulting broadcast events preempt the reconciler's periodic pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::RegistryEvent;
use crate::error::{Error, Result};
use crate::resources::{Node, NodeId, NodeStatus};

// =============================================================================
// Global Statistics
// =============================================================================

/// Counters across the whole node registry
#[derive(Debug, Default)]
pub struct NodeStats {
    /// Nodes currently registered
    pub total_nodes: AtomicU64,
    /// Nodes currently online
    pub online_nodes: AtomicU64,
    /// Registration events
    pub registrations: AtomicU64,
    /// Deregistration events
    pub deregistrations: AtomicU64,
    /// Heartbeats recorded
    pub heartbeats: AtomicU64,
    /// Offline transitions
    pub offline_transitions: AtomicU64,
}

impl NodeStats {
    /// Create a snapshot of current stats
    pub fn snapshot(&self) -> NodeStatsSnapshot {
        NodeStatsSnapshot {
            total_nodes: self.total_nodes.load(Ordering::Relaxed),
            online_nodes: self.online_nodes.load(Ordering::Relaxed),
            registrations: self.registrations.load(Ordering::Relaxed),
            deregistrations: self.deregistrations.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            offline_transitions: self.offline_transitions.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of node registry statistics
#[derive(Debug, Clone)]
pub struct NodeStatsSnapshot {
    pub total_nodes: u64,
    pub online_nodes: u64,
    pub registrations: u64,
    pub deregistrations: u64,
    pub heartbeats: u64,
    pub offline_transitions: u64,
}

// =============================================================================
// Node Registry
// =============================================================================

/// Heartbeat-driven node registry
pub struct NodeRegistry {
    /// Registered nodes
    nodes: RwLock<HashMap<NodeId, Node>>,
    /// Global statistics
    stats: NodeStats,
    /// Event broadcaster, shared with the resource registry
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl NodeRegistry {
    /// Create a new node registry publishing on the given event bus
    pub fn new(event_sender: broadcast::Sender<RegistryEvent>) -> Arc<Self> {
        Arc::new(Self {
            nodes: RwLock::new(HashMap::new()),
            stats: NodeStats::default(),
            event_sender,
        })
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Register a new node
    pub fn register(&self, node_id: impl Into<NodeId>, endpoint: impl Into<String>) -> Result<()> {
        let node_id = node_id.into();
        let endpoint = endpoint.into();
        let now = Utc::now();

        {
            let mut nodes = self.nodes.write();
            if nodes.contains_key(&node_id) {
                return Err(Error::NodeAlreadyRegistered {
                    node_id: node_id.to_string(),
                });
            }
            nodes.insert(
                node_id.clone(),
                Node {
                    id: node_id.clone(),
                    endpoint: endpoint.clone(),
                    status: NodeStatus::Online,
                    registered_at: now,
                    last_heartbeat: now,
                },
            );
        }

        self.stats.total_nodes.fetch_add(1, Ordering::Relaxed);
        self.stats.online_nodes.fetch_add(1, Ordering::Relaxed);
        self.stats.registrations.fetch_add(1, Ordering::Relaxed);

        info!(node = %node_id, %endpoint, "node registered");
        let _ = self.event_sender.send(RegistryEvent::NodeRegistered {
            node_id,
            endpoint,
        });

        Ok(())
    }

    /// Deregister a node
    pub fn deregister(&self, node_id: &NodeId) -> Result<()> {
        let removed = self.nodes.write().remove(node_id);
        match removed {
            Some(node) => {
                self.stats.total_nodes.fetch_sub(1, Ordering::Relaxed);
                if node.is_online() {
                    self.stats.online_nodes.fetch_sub(1, Ordering::Relaxed);
                }
                self.stats.deregistrations.fetch_add(1, Ordering::Relaxed);

                let _ = self.event_sender.send(RegistryEvent::NodeDeregistered {
                    node_id: node_id.clone(),
                });
                Ok(())
            }
            None => Err(Error::NodeNotFound {
                node_id: node_id.to_string(),
            }),
        }
    }

    /// Record a heartbeat from a node
    ///
    /// A heartbeat from an Offline node brings it back Online and emits
    /// `NodeCameOnline`.
    pub fn heartbeat(&self, node_id: &NodeId) -> Result<()> {
        let came_online = {
            let mut nodes = self.nodes.write();
            let node = nodes.get_mut(node_id).ok_or_else(|| Error::NodeNotFound {
                node_id: node_id.to_string(),
            })?;
            node.last_heartbeat = Utc::now();
            let came_online = node.status == NodeStatus::Offline;
            node.status = NodeStatus::Online;
            came_online
        };

        self.stats.heartbeats.fetch_add(1, Ordering::Relaxed);
        if came_online {
            self.stats.online_nodes.fetch_add(1, Ordering::Relaxed);
            info!(node = %node_id, "node came back online");
            let _ = self.event_sender.send(RegistryEvent::NodeCameOnline {
                node_id: node_id.clone(),
            });
        }
        Ok(())
    }

    /// Force a node offline, emitting the liveness event
    ///
    /// Returns true when the node transitioned.
    pub fn mark_offline(&self, node_id: &NodeId) -> Result<bool> {
        let transitioned = {
            let mut nodes = self.nodes.write();
            let node = nodes.get_mut(node_id).ok_or_else(|| Error::NodeNotFound {
                node_id: node_id.to_string(),
            })?;
            let transitioned = node.status == NodeStatus::Online;
            node.status = NodeStatus::Offline;
            transitioned
        };

        if transitioned {
            self.stats.online_nodes.fetch_sub(1, Ordering::Relaxed);
            self.stats.offline_transitions.fetch_add(1, Ordering::Relaxed);
            warn!(node = %node_id, "node marked offline");
            let _ = self.event_sender.send(RegistryEvent::NodeWentOffline {
                node_id: node_id.clone(),
            });
        }
        Ok(transitioned)
    }

    /// Get a node snapshot by ID
    pub fn get(&self, node_id: &NodeId) -> Option<Node> {
        self.nodes.read().get(node_id).cloned()
    }

    /// Check if a node exists
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes.read().contains_key(node_id)
    }

    /// Check if a node is registered and online
    pub fn is_online(&self, node_id: &NodeId) -> bool {
        self.nodes
            .read()
            .get(node_id)
            .map(|n| n.is_online())
            .unwrap_or(false)
    }

    /// Get all node snapshots
    pub fn list(&self) -> Vec<Node> {
        self.nodes.read().values().cloned().collect()
    }

    /// Get all node IDs
    pub fn all_node_ids(&self) -> Vec<NodeId> {
        self.nodes.read().keys().cloned().collect()
    }

    /// Get all online node IDs
    pub fn online_node_ids(&self) -> Vec<NodeId> {
        self.nodes
            .read()
            .values()
            .filter(|n| n.is_online())
            .map(|n| n.id.clone())
            .collect()
    }

    /// Get node statistics
    pub fn stats(&self) -> NodeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Mark nodes whose heartbeat is older than `max_age` offline
    ///
    /// Returns the nodes that transitioned; an event is emitted per node.
    pub fn mark_stale_offline(&self, max_age: Duration) -> Vec<NodeId> {
        let now = Utc::now();
        let stale: Vec<NodeId> = {
            let nodes = self.nodes.read();
            nodes
                .values()
                .filter(|n| {
                    n.is_online()
                        && now
                            .signed_duration_since(n.last_heartbeat)
                            .to_std()
                            .map(|age| age > max_age)
                            .unwrap_or(false)
                })
                .map(|n| n.id.clone())
                .collect()
        };

        let mut transitioned = Vec::new();
        for node_id in stale {
            // Re-checked under the write lock inside mark_offline; a
            // heartbeat may have raced in.
            if let Ok(true) = self.mark_offline(&node_id) {
                transitioned.push(node_id);
            }
        }
        transitioned
    }

    /// Spawn the heartbeat watchdog task
    ///
    /// Runs at `interval`, expiring nodes stale past `max_age`, until the
    /// token is cancelled.
    pub fn spawn_watchdog(
        self: &Arc<Self>,
        interval: Duration,
        max_age: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("node watchdog stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let expired = registry.mark_stale_offline(max_age);
                        if !expired.is_empty() {
                            warn!(count = expired.len(), "expired stale nodes");
                        }
                    }
                }
            }
        })
    }
}
