//! Storage pool model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{NodeId, PoolId};

/// Pool availability
///
/// A pool on an offline node is reported Unknown, not destroyed: its backing
/// devices and replicas are expected to reappear when the node returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    Online,
    Unknown,
}

impl std::fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolStatus::Online => write!(f, "online"),
            PoolStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// A pool and its last observed usage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    /// Pool ID
    pub id: PoolId,
    /// Node the pool lives on
    pub node: NodeId,
    /// Backing disk URIs
    pub disks: Vec<String>,
    /// Total capacity in bytes
    pub capacity_bytes: u64,
    /// Bytes committed to replicas
    pub used_bytes: u64,
    /// Availability
    pub status: PoolStatus,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Pool {
    pub fn free_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.used_bytes)
    }

    /// Whether a replica of `size_bytes` fits right now
    pub fn fits(&self, size_bytes: u64) -> bool {
        self.status == PoolStatus::Online && self.free_bytes() >= size_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(capacity: u64, used: u64, status: PoolStatus) -> Pool {
        Pool {
            id: PoolId::from("pool-1"),
            node: NodeId::from("io-engine-1"),
            disks: vec!["malloc:///disk0?size_mb=100".into()],
            capacity_bytes: capacity,
            used_bytes: used,
            status,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_free_bytes_saturates() {
        assert_eq!(pool(100, 40, PoolStatus::Online).free_bytes(), 60);
        assert_eq!(pool(100, 140, PoolStatus::Online).free_bytes(), 0);
    }

    #[test]
    fn test_fits_requires_online() {
        assert!(pool(100, 40, PoolStatus::Online).fits(60));
        assert!(!pool(100, 40, PoolStatus::Online).fits(61));
        assert!(!pool(100, 0, PoolStatus::Unknown).fits(10));
    }
}
