//! Replica Placement
//!
//! Selects pools for new replicas. Candidates are ranked most-free-first
//! and the selection enforces strict anti-affinity: one replica per pool
//! and per node, skipping nodes that already host a replica of the volume.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::registry::{NodeRegistry, ResourceRegistry};
use crate::resources::{NodeId, PoolId, VolumeId};

// =============================================================================
// Placement Candidate
// =============================================================================

/// A pool eligible to host a new replica
#[derive(Debug, Clone)]
pub struct PoolCandidate {
    /// Pool ID
    pub pool: PoolId,
    /// Node hosting the pool
    pub node: NodeId,
    /// Free capacity in bytes
    pub free_bytes: u64,
}

// =============================================================================
// Placement Result
// =============================================================================

/// Outcome of a placement calculation
#[derive(Debug, Clone)]
pub struct PlacementResult {
    /// Selected pools, best first
    pub selected: Vec<PoolCandidate>,
    /// Nodes the selection landed on
    pub nodes_used: HashSet<NodeId>,
}

// =============================================================================
// Placement Engine
// =============================================================================

/// Engine for ranking and selecting replica pools
pub struct PlacementEngine;

impl PlacementEngine {
    /// Pools eligible to receive a replica of `size_bytes`
    ///
    /// A pool qualifies when it is Online, its node is Online in the
    /// registry, and its free capacity covers the requested size.
    pub fn eligible_candidates(
        resources: &ResourceRegistry,
        nodes: &NodeRegistry,
        size_bytes: u64,
    ) -> Vec<PoolCandidate> {
        resources
            .list_pools()
            .into_iter()
            .filter(|pool| pool.fits(size_bytes) && nodes.is_online(&pool.node))
            .map(|pool| PoolCandidate {
                free_bytes: pool.free_bytes(),
                pool: pool.id,
                node: pool.node,
            })
            .collect()
    }

    /// Select `count` pools for new replicas of `volume`
    ///
    /// Candidates on `exclude_nodes` are skipped, as is any node already
    /// chosen within this selection. Ordering is free capacity descending
    /// with pool id ascending as the tie break, so equal clusters place
    /// deterministically.
    pub fn select(
        volume: &VolumeId,
        candidates: &[PoolCandidate],
        count: usize,
        exclude_nodes: &HashSet<NodeId>,
    ) -> Result<PlacementResult> {
        if count == 0 {
            return Ok(PlacementResult {
                selected: Vec::new(),
                nodes_used: HashSet::new(),
            });
        }

        let mut ranked: Vec<&PoolCandidate> = candidates
            .iter()
            .filter(|c| !exclude_nodes.contains(&c.node))
            .collect();
        ranked.sort_by(|a, b| {
            b.free_bytes
                .cmp(&a.free_bytes)
                .then_with(|| a.pool.as_str().cmp(b.pool.as_str()))
        });

        let mut selected = Vec::with_capacity(count);
        let mut nodes_used: HashSet<NodeId> = HashSet::new();
        for candidate in ranked.iter() {
            if selected.len() >= count {
                break;
            }
            if nodes_used.contains(&candidate.node) {
                continue;
            }
            nodes_used.insert(candidate.node.clone());
            selected.push((*candidate).clone());
        }

        if selected.len() < count {
            return Err(Error::NoSuitablePool {
                volume: volume.to_string(),
                needed: count - selected.len(),
                candidates: ranked.len(),
            });
        }

        Ok(PlacementResult {
            selected,
            nodes_used,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn make_candidate(pool: &str, node: &str, free: u64) -> PoolCandidate {
        PoolCandidate {
            pool: pool.into(),
            node: node.into(),
            free_bytes: free,
        }
    }

    #[test]
    fn test_select_most_free_on_distinct_nodes() {
        let volume = VolumeId::new_random();
        let candidates = vec![
            make_candidate("pool-a", "node-1", 500),
            make_candidate("pool-b", "node-1", 900),
            make_candidate("pool-c", "node-2", 700),
            make_candidate("pool-d", "node-3", 300),
        ];

        let result =
            PlacementEngine::select(&volume, &candidates, 3, &HashSet::new()).unwrap();

        // pool-b wins node-1, pool-a is skipped for sharing its node
        let picked: Vec<&str> = result.selected.iter().map(|c| c.pool.as_str()).collect();
        assert_eq!(picked, vec!["pool-b", "pool-c", "pool-d"]);
        assert_eq!(result.nodes_used.len(), 3);
    }

    #[test]
    fn test_select_tie_breaks_on_pool_id() {
        let volume = VolumeId::new_random();
        let candidates = vec![
            make_candidate("pool-z", "node-1", 500),
            make_candidate("pool-a", "node-2", 500),
            make_candidate("pool-m", "node-3", 500),
        ];

        let result =
            PlacementEngine::select(&volume, &candidates, 2, &HashSet::new()).unwrap();

        let picked: Vec<&str> = result.selected.iter().map(|c| c.pool.as_str()).collect();
        assert_eq!(picked, vec!["pool-a", "pool-m"]);
    }

    #[test]
    fn test_select_skips_excluded_nodes() {
        let volume = VolumeId::new_random();
        let candidates = vec![
            make_candidate("pool-a", "node-1", 900),
            make_candidate("pool-b", "node-2", 700),
        ];
        let exclude: HashSet<NodeId> = [NodeId::from("node-1")].into_iter().collect();

        let result = PlacementEngine::select(&volume, &candidates, 1, &exclude).unwrap();
        assert_eq!(result.selected[0].pool.as_str(), "pool-b");
    }

    #[test]
    fn test_select_errors_when_nodes_run_out() {
        let volume = VolumeId::new_random();
        // two pools but a single node: anti-affinity caps the selection at one
        let candidates = vec![
            make_candidate("pool-a", "node-1", 900),
            make_candidate("pool-b", "node-1", 700),
        ];

        let err =
            PlacementEngine::select(&volume, &candidates, 2, &HashSet::new()).unwrap_err();
        assert_matches!(err, Error::NoSuitablePool { needed: 1, candidates: 2, .. });
    }

    #[test]
    fn test_zero_count_selects_nothing() {
        let volume = VolumeId::new_random();
        let result = PlacementEngine::select(&volume, &[], 0, &HashSet::new()).unwrap();
        assert!(result.selected.is_empty());
    }
}
