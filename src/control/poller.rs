//! State Poller
//!
//! Refreshes the registry from observed engine state every `cache_period`:
//! pool capacity and usage, child health (rebuild completion and faults the
//! liveness path has not seen yet), nexus shutdown flags, and path
//! confirmation (Connecting to Live once the host side is up). The poller
//! only reads from engines; every mutation stays with the managers.

use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::bounded;
use crate::config::ControlPlaneConfig;
use crate::engine::{EngineNodeState, IoEngineRef};
use crate::error::Result;
use crate::registry::Registry;
use crate::resources::{ChildState, NodeId, PathState};

/// Periodic engine-state refresher
pub struct StatePoller {
    registry: Arc<Registry>,
    engine: IoEngineRef,
    config: ControlPlaneConfig,
}

impl StatePoller {
    pub fn new(
        registry: Arc<Registry>,
        engine: IoEngineRef,
        config: ControlPlaneConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            engine,
            config,
        })
    }

    /// Spawn the polling loop
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let poller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poller.config.cache_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("State poller stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        poller.poll_once().await;
                    }
                }
            }
        })
    }

    /// One full refresh over all online nodes
    pub async fn poll_once(&self) {
        for node in self.registry.nodes.online_node_ids() {
            match self.fetch_node_state(&node).await {
                Ok(state) => self.apply_node_state(&node, &state),
                Err(err) => {
                    debug!(node = %node, error = %err, "Node poll skipped");
                }
            }
        }
    }

    /// Read one node's state, retrying transient failures with backoff
    async fn fetch_node_state(&self, node: &NodeId) -> Result<EngineNodeState> {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(50),
            max_elapsed_time: Some(self.config.node_conn_timeout),
            ..ExponentialBackoff::default()
        };
        backoff::future::retry(policy, || async {
            bounded(
                node,
                self.config.node_conn_timeout,
                self.engine.node_state(node),
            )
            .await
            .map_err(|err| {
                if err.is_transient() {
                    backoff::Error::transient(err)
                } else {
                    backoff::Error::permanent(err)
                }
            })
        })
        .await
    }

    fn apply_node_state(&self, node: &NodeId, state: &EngineNodeState) {
        // pool capacity and usage
        for pool in &state.pools {
            if self.registry.resources.get_pool(&pool.id).is_some() {
                self.registry
                    .resources
                    .set_pool_usage(&pool.id, pool.capacity_bytes, pool.used_bytes);
            }
        }

        // nexus children, shutdown flags, path confirmation
        for nexus in self.registry.resources.nexuses_on_node(node) {
            let observed = state.nexuses.iter().find(|n| n.id == nexus.id);
            match observed {
                None => {
                    // the engine lost the nexus, every child is gone with it
                    warn!(nexus = %nexus.id, node = %node, "Nexus missing from engine state");
                    for child in &nexus.children {
                        let _ = self.registry.resources.set_child_state(
                            &nexus.id,
                            &child.replica,
                            ChildState::Faulted,
                        );
                    }
                }
                Some(observed) => {
                    if observed.shutdown && !nexus.shutdown {
                        let _ = self.registry.resources.set_nexus_shutdown(&nexus.id);
                    }
                    for child in &nexus.children {
                        let seen = observed
                            .children
                            .iter()
                            .find(|c| c.uri == child.uri)
                            .map(|c| c.state)
                            // detached behind our back counts as faulted
                            .unwrap_or(ChildState::Faulted);
                        if seen != child.state {
                            trace!(
                                nexus = %nexus.id,
                                replica = %child.replica,
                                from = %child.state,
                                to = %seen,
                                "Child state observed"
                            );
                            let _ = self.registry.resources.set_child_state(
                                &nexus.id,
                                &child.replica,
                                seen,
                            );
                        }
                    }
                    if observed.host_connected {
                        if let Some(path) = self.registry.resources.get_path(&nexus.id) {
                            if path.state == PathState::Connecting {
                                let _ = self
                                    .registry
                                    .resources
                                    .set_path_state(&nexus.id, PathState::Live);
                            }
                        }
                    }
                }
            }
        }
    }
}
