//! Error types for the blockplane control plane
//!
//! Provides structured error types for all control-plane components including
//! the node registry, placement, volume reconciliation, and target publishing.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the control plane
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Resource Errors
    // =========================================================================
    #[error("Resource not found: {kind}/{id}")]
    NotFound { kind: String, id: String },

    #[error("Resource already exists: {kind}/{id}")]
    AlreadyExists { kind: String, id: String },

    #[error("Resource in use: {kind}/{id} - {reason}")]
    ResourceInUse {
        kind: String,
        id: String,
        reason: String,
    },

    // =========================================================================
    // Volume Spec Errors
    // =========================================================================
    #[error("Invalid volume spec for {volume}: {reason}")]
    InvalidSpec { volume: String, reason: String },

    #[error("Volume {volume} is already published on node {node}")]
    AlreadyPublished { volume: String, node: String },

    #[error("Volume {volume} is not published")]
    NotPublished { volume: String },

    #[error("Volume {volume} is being deleted")]
    VolumeDeleting { volume: String },

    // =========================================================================
    // Placement Errors
    // =========================================================================
    #[error("No suitable pool for volume {volume}: needed {needed} more replica(s), {candidates} candidate pool(s)")]
    NoSuitablePool {
        volume: String,
        needed: usize,
        candidates: usize,
    },

    #[error("Insufficient capacity: requested {requested} bytes, available {available} bytes")]
    InsufficientCapacity { requested: u64, available: u64 },

    #[error("No suitable target node for volume {volume}: {reason}")]
    NoSuitableNode { volume: String, reason: String },

    #[error("No online replicas for volume {volume}")]
    NoOnlineReplicas { volume: String },

    // =========================================================================
    // Node Registry Errors
    // =========================================================================
    #[error("Node not found: {node_id}")]
    NodeNotFound { node_id: String },

    #[error("Node already registered: {node_id}")]
    NodeAlreadyRegistered { node_id: String },

    #[error("Node unreachable: {node_id}")]
    NodeUnreachable { node_id: String },

    // =========================================================================
    // Engine Errors
    // =========================================================================
    #[error("Engine operation failed on {node}: {operation}: {reason}")]
    EngineOperationFailed {
        node: String,
        operation: String,
        reason: String,
    },

    // =========================================================================
    // Target/Path Errors
    // =========================================================================
    #[error("Path for volume {volume} on node {node} did not connect within {waited_ms}ms")]
    PathTimeout {
        volume: String,
        node: String,
        waited_ms: u64,
    },

    // =========================================================================
    // API Errors
    // =========================================================================
    #[error("API request validation failed: {0}")]
    ApiValidation(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Duration parse error: {0}")]
    DurationParse(String),

    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::NodeUnreachable { .. } | Error::EngineOperationFailed { .. } => {
                ErrorAction::RequeueWithBackoff
            }

            // Path establishment - check again soon
            Error::PathTimeout { .. } => ErrorAction::RequeueAfter(Duration::from_secs(30)),

            // Resource issues - medium retry, capacity may free up
            Error::NoSuitablePool { .. }
            | Error::InsufficientCapacity { .. }
            | Error::NoSuitableNode { .. }
            | Error::NoOnlineReplicas { .. } => ErrorAction::RequeueAfter(Duration::from_secs(60)),

            // Spec/validation errors - don't retry automatically
            Error::Configuration(_)
            | Error::InvalidSpec { .. }
            | Error::ApiValidation(_)
            | Error::DurationParse(_)
            | Error::CapacityParse(_) => ErrorAction::NoRequeue,

            // Caller must resolve these explicitly
            Error::NotFound { .. }
            | Error::AlreadyExists { .. }
            | Error::ResourceInUse { .. }
            | Error::AlreadyPublished { .. }
            | Error::NotPublished { .. }
            | Error::VolumeDeleting { .. }
            | Error::NodeAlreadyRegistered { .. } => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::NodeUnreachable { .. }
                | Error::EngineOperationFailed { .. }
                | Error::PathTimeout { .. }
        )
    }

    /// Shorthand for a not-found error
    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }
}

/// Result type alias for the control plane
pub type Result<T> = std::result::Result<T, Error>;
