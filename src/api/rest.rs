//! REST API Handlers
//!
//! Implements the REST API endpoints for volume lifecycle, target
//! publishing, pool management, and node inspection.

use crate::control::{PoolService, VolumeService};
use crate::error::Error;
use crate::registry::Registry;
use crate::resources::{volume_nqn, NodeId, Pool, PoolId, Protocol, Volume, VolumeId, VolumePolicy};
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

// =============================================================================
// Request/Response Types
// =============================================================================

/// Pool creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePoolRequest {
    /// Backing disk URIs
    pub disks: Vec<String>,
}

/// Pool info response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolResponse {
    pub id: String,
    pub node: String,
    pub disks: Vec<String>,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub status: String,
}

impl From<Pool> for PoolResponse {
    fn from(pool: Pool) -> Self {
        Self {
            id: pool.id.to_string(),
            node: pool.node.to_string(),
            disks: pool.disks,
            capacity_bytes: pool.capacity_bytes,
            used_bytes: pool.used_bytes,
            status: pool.status.to_string(),
        }
    }
}

/// Node info response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResponse {
    pub id: String,
    pub endpoint: String,
    pub status: String,
    pub last_heartbeat: String,
}

/// Volume creation request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeRequest {
    /// Size in bytes
    pub size_bytes: u64,
    /// Desired replica count
    pub num_replicas: u8,
    /// Thin provisioning
    #[serde(default)]
    pub thin: bool,
    /// Behavior knobs, self-healing on by default
    #[serde(default)]
    pub policy: VolumePolicy,
}

/// Target publish request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    /// Preferred target node; placement decides when absent
    #[serde(default)]
    pub node: Option<String>,
    /// Share protocol
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Move an already published target instead of failing
    #[serde(default)]
    pub republish: bool,
    /// Return the current target instead of failing when already published
    #[serde(default)]
    pub reuse_existing: bool,
}

fn default_protocol() -> String {
    "nvmf".into()
}

/// Replica count change request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetReplicaCountRequest {
    /// New desired replica count
    pub count: u8,
}

/// Published target view
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetResponse {
    pub node: String,
    pub protocol: String,
    pub nexus: String,
    pub device_uri: String,
}

/// Per-replica placement and health
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaTopologyResponse {
    pub node: String,
    pub pool: String,
    pub state: String,
}

/// Volume response: desired spec plus observed state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeResponse {
    pub uuid: String,
    pub size_bytes: u64,
    pub num_replicas: u8,
    pub thin: bool,
    pub policy: VolumePolicy,
    pub status: String,
    pub deleting: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetResponse>,
    pub replica_topology: BTreeMap<String, ReplicaTopologyResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shortfall: Option<String>,
}

impl From<Volume> for VolumeResponse {
    fn from(volume: Volume) -> Self {
        Self {
            uuid: volume.spec.uuid.to_string(),
            size_bytes: volume.spec.size_bytes,
            num_replicas: volume.spec.num_replicas,
            thin: volume.spec.thin,
            policy: volume.spec.policy,
            status: volume.state.status.to_string(),
            deleting: volume.spec.deleting,
            target: volume.spec.target_config.map(|t| TargetResponse {
                node: t.node.to_string(),
                protocol: t.protocol.to_string(),
                nexus: t.nexus.to_string(),
                device_uri: t.device_uri,
            }),
            replica_topology: volume
                .state
                .replica_topology
                .into_iter()
                .map(|(id, t)| {
                    (
                        id.to_string(),
                        ReplicaTopologyResponse {
                            node: t.node.to_string(),
                            pool: t.pool.to_string(),
                            state: t.state.to_string(),
                        },
                    )
                })
                .collect(),
            shortfall: volume.state.shortfall,
        }
    }
}

/// One host path to a volume target, mirroring the NVMe subsystem listing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathResponse {
    /// Subsystem NQN, identical across all paths of a volume
    pub name: String,
    pub nexus: String,
    pub node: String,
    pub address: String,
    pub device_uri: String,
    pub state: String,
    pub created_at: String,
}

/// Retired target cleanup response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownTargetsResponse {
    pub destroyed: usize,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    registry: Arc<Registry>,
    pools: Arc<PoolService>,
    volumes: Arc<VolumeService>,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(
        registry: Arc<Registry>,
        pools: Arc<PoolService>,
        volumes: Arc<VolumeService>,
    ) -> Self {
        Self {
            registry,
            pools,
            volumes,
        }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            registry: self.registry,
            pools: self.pools,
            volumes: self.volumes,
        };

        Router::new()
            // Node endpoints
            .route("/v0/nodes", get(list_nodes))
            .route("/v0/nodes/:id", get(get_node))
            // Pool endpoints
            .route("/v0/pools", get(list_pools))
            .route("/v0/pools/:node/:pool", put(put_pool))
            .route("/v0/pools/:pool", get(get_pool))
            .route("/v0/pools/:pool", delete(delete_pool))
            // Volume endpoints
            .route("/v0/volumes", get(list_volumes))
            .route("/v0/volumes/:uuid", put(put_volume))
            .route("/v0/volumes/:uuid", get(get_volume))
            .route("/v0/volumes/:uuid", delete(delete_volume))
            // Target endpoints
            .route("/v0/volumes/:uuid/target", put(put_volume_target))
            .route("/v0/volumes/:uuid/target", delete(delete_volume_target))
            .route("/v0/volumes/:uuid/replica_count", put(put_replica_count))
            .route(
                "/v0/volumes/:uuid/shutdown_targets",
                delete(delete_shutdown_targets),
            )
            .route("/v0/volumes/:uuid/paths", get(get_volume_paths))
            // Health endpoints
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
    pools: Arc<PoolService>,
    volumes: Arc<VolumeService>,
}

// =============================================================================
// Node Handlers
// =============================================================================

/// List all nodes
async fn list_nodes(State(state): State<AppState>) -> impl IntoResponse {
    let mut nodes = state.registry.nodes.list();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));
    let nodes: Vec<NodeResponse> = nodes
        .into_iter()
        .map(|n| NodeResponse {
            id: n.id.to_string(),
            endpoint: n.endpoint,
            status: n.status.to_string(),
            last_heartbeat: n.last_heartbeat.to_rfc3339(),
        })
        .collect();
    (StatusCode::OK, Json(nodes))
}

/// Get one node
async fn get_node(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.registry.nodes.get(&NodeId::from(id.as_str())) {
        Some(n) => (
            StatusCode::OK,
            Json(NodeResponse {
                id: n.id.to_string(),
                endpoint: n.endpoint,
                status: n.status.to_string(),
                last_heartbeat: n.last_heartbeat.to_rfc3339(),
            }),
        )
            .into_response(),
        None => error_response(Error::not_found("node", id)),
    }
}

// =============================================================================
// Pool Handlers
// =============================================================================

/// Create a pool on a node
async fn put_pool(
    State(state): State<AppState>,
    Path((node, pool)): Path<(String, String)>,
    Json(request): Json<CreatePoolRequest>,
) -> impl IntoResponse {
    debug!(pool = %pool, node = %node, "Pool create requested");
    let node = NodeId::from(node);
    let pool = PoolId::from(pool);
    match state.pools.create_pool(&node, &pool, request.disks).await {
        Ok(pool) => (StatusCode::CREATED, Json(PoolResponse::from(pool))).into_response(),
        Err(err) => error_response(err),
    }
}

/// List pools
async fn list_pools(State(state): State<AppState>) -> impl IntoResponse {
    let mut pools = state.registry.resources.list_pools();
    pools.sort_by(|a, b| a.id.cmp(&b.id));
    let pools: Vec<PoolResponse> = pools.into_iter().map(PoolResponse::from).collect();
    (StatusCode::OK, Json(pools))
}

/// Get one pool
async fn get_pool(State(state): State<AppState>, Path(pool): Path<String>) -> impl IntoResponse {
    match state.registry.resources.get_pool(&PoolId::from(pool.as_str())) {
        Some(pool) => (StatusCode::OK, Json(PoolResponse::from(pool))).into_response(),
        None => error_response(Error::not_found("pool", pool)),
    }
}

#[derive(Debug, Deserialize)]
struct CascadeQuery {
    #[serde(default)]
    cascade: bool,
}

/// Delete a pool, optionally destroying resident replicas
async fn delete_pool(
    State(state): State<AppState>,
    Path(pool): Path<String>,
    Query(query): Query<CascadeQuery>,
) -> impl IntoResponse {
    debug!(pool = %pool, cascade = query.cascade, "Pool delete requested");
    match state
        .pools
        .delete_pool(&PoolId::from(pool), query.cascade)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

// =============================================================================
// Volume Handlers
// =============================================================================

/// Create a volume
async fn put_volume(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Json(request): Json<CreateVolumeRequest>,
) -> impl IntoResponse {
    debug!(volume = %uuid, replicas = request.num_replicas, "Volume create requested");
    let volume = match uuid.parse::<VolumeId>() {
        Ok(volume) => volume,
        Err(err) => return error_response(err),
    };
    match state
        .volumes
        .create_volume(
            volume,
            request.size_bytes,
            request.num_replicas,
            request.thin,
            request.policy,
        )
        .await
    {
        Ok(volume) => (StatusCode::CREATED, Json(VolumeResponse::from(volume))).into_response(),
        Err(err) => error_response(err),
    }
}

/// List volumes
async fn list_volumes(State(state): State<AppState>) -> impl IntoResponse {
    let volumes: Vec<VolumeResponse> = state
        .volumes
        .list_volumes()
        .into_iter()
        .map(VolumeResponse::from)
        .collect();
    (StatusCode::OK, Json(volumes))
}

/// Get one volume
async fn get_volume(State(state): State<AppState>, Path(uuid): Path<String>) -> impl IntoResponse {
    let volume = match uuid.parse::<VolumeId>() {
        Ok(volume) => volume,
        Err(err) => return error_response(err),
    };
    match state.volumes.get_volume(&volume) {
        Ok(volume) => (StatusCode::OK, Json(VolumeResponse::from(volume))).into_response(),
        Err(err) => error_response(err),
    }
}

/// Destroy a volume
async fn delete_volume(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> impl IntoResponse {
    debug!(volume = %uuid, "Volume delete requested");
    let volume = match uuid.parse::<VolumeId>() {
        Ok(volume) => volume,
        Err(err) => return error_response(err),
    };
    match state.volumes.destroy_volume(&volume).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

// =============================================================================
// Target Handlers
// =============================================================================

/// Publish a volume target, or move it when republish is set
async fn put_volume_target(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Json(request): Json<PublishRequest>,
) -> impl IntoResponse {
    debug!(volume = %uuid, republish = request.republish, "Target publish requested");
    let volume = match uuid.parse::<VolumeId>() {
        Ok(volume) => volume,
        Err(err) => return error_response(err),
    };
    let protocol = match request.protocol.parse::<Protocol>() {
        Ok(protocol) => protocol,
        Err(err) => return error_response(err),
    };
    let node = request.node.map(|n| NodeId::from(n.as_str()));
    match state
        .volumes
        .publish(
            &volume,
            node,
            protocol,
            request.republish,
            request.reuse_existing,
        )
        .await
    {
        Ok(volume) => (StatusCode::OK, Json(VolumeResponse::from(volume))).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct ForceQuery {
    #[serde(default)]
    force: bool,
}

/// Unpublish a volume target
async fn delete_volume_target(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Query(query): Query<ForceQuery>,
) -> impl IntoResponse {
    debug!(volume = %uuid, force = query.force, "Target unpublish requested");
    let volume = match uuid.parse::<VolumeId>() {
        Ok(volume) => volume,
        Err(err) => return error_response(err),
    };
    match state.volumes.unpublish(&volume, query.force).await {
        Ok(volume) => (StatusCode::OK, Json(VolumeResponse::from(volume))).into_response(),
        Err(err) => error_response(err),
    }
}

/// Change the desired replica count
async fn put_replica_count(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
    Json(request): Json<SetReplicaCountRequest>,
) -> impl IntoResponse {
    debug!(volume = %uuid, count = request.count, "Replica count change requested");
    let volume = match uuid.parse::<VolumeId>() {
        Ok(volume) => volume,
        Err(err) => return error_response(err),
    };
    match state.volumes.set_replica_count(&volume, request.count).await {
        Ok(volume) => (StatusCode::OK, Json(VolumeResponse::from(volume))).into_response(),
        Err(err) => error_response(err),
    }
}

/// Destroy targets retired by earlier republishes
async fn delete_shutdown_targets(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> impl IntoResponse {
    let volume = match uuid.parse::<VolumeId>() {
        Ok(volume) => volume,
        Err(err) => return error_response(err),
    };
    match state.volumes.destroy_shutdown_targets(&volume).await {
        Ok(destroyed) => (
            StatusCode::OK,
            Json(ShutdownTargetsResponse { destroyed }),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

/// List host paths for a volume
async fn get_volume_paths(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> impl IntoResponse {
    let volume = match uuid.parse::<VolumeId>() {
        Ok(volume) => volume,
        Err(err) => return error_response(err),
    };
    if state.registry.resources.get_volume_spec(&volume).is_none() {
        return error_response(Error::not_found("volume", volume));
    }
    let paths: Vec<PathResponse> = state
        .registry
        .resources
        .paths_of(&volume)
        .into_iter()
        .map(|p| PathResponse {
            name: volume_nqn(&p.volume),
            nexus: p.nexus.to_string(),
            node: p.node.to_string(),
            address: p.address,
            device_uri: p.device_uri,
            state: p.state.to_string(),
            created_at: p.created_at.to_rfc3339(),
        })
        .collect();
    (StatusCode::OK, Json(paths)).into_response()
}

// =============================================================================
// Health Handlers
// =============================================================================

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.registry.nodes.stats();
    if stats.online_nodes > 0 {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "no nodes online")
    }
}

// =============================================================================
// Error Mapping
// =============================================================================

fn status_code(err: &Error) -> StatusCode {
    match err {
        Error::ApiValidation(_)
        | Error::InvalidSpec { .. }
        | Error::DurationParse(_)
        | Error::CapacityParse(_)
        | Error::JsonParse(_) => StatusCode::BAD_REQUEST,

        Error::NotFound { .. } | Error::NodeNotFound { .. } => StatusCode::NOT_FOUND,

        Error::AlreadyExists { .. }
        | Error::NodeAlreadyRegistered { .. }
        | Error::ResourceInUse { .. }
        | Error::AlreadyPublished { .. }
        | Error::NotPublished { .. }
        | Error::VolumeDeleting { .. } => StatusCode::CONFLICT,

        Error::NoSuitablePool { .. }
        | Error::NoSuitableNode { .. }
        | Error::InsufficientCapacity { .. }
        | Error::NoOnlineReplicas { .. } => StatusCode::UNPROCESSABLE_ENTITY,

        Error::NodeUnreachable { .. }
        | Error::EngineOperationFailed { .. }
        | Error::PathTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,

        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_kind(err: &Error) -> &'static str {
    match err {
        Error::NotFound { .. } | Error::NodeNotFound { .. } => "not_found",
        Error::AlreadyExists { .. } | Error::NodeAlreadyRegistered { .. } => "already_exists",
        Error::ResourceInUse { .. } => "in_use",
        Error::InvalidSpec { .. } => "invalid_spec",
        Error::AlreadyPublished { .. } => "already_published",
        Error::NotPublished { .. } => "not_published",
        Error::VolumeDeleting { .. } => "deleting",
        Error::NoSuitablePool { .. }
        | Error::NoSuitableNode { .. }
        | Error::InsufficientCapacity { .. }
        | Error::NoOnlineReplicas { .. } => "unsatisfiable",
        Error::NodeUnreachable { .. }
        | Error::EngineOperationFailed { .. }
        | Error::PathTimeout { .. } => "unavailable",
        Error::ApiValidation(_) => "invalid_request",
        _ => "internal_error",
    }
}

fn error_response(err: Error) -> Response {
    let status = status_code(&err);
    let details = err
        .is_transient()
        .then(|| "transient, retry the request".to_string());
    debug!(error = %err, status = %status, "Request failed");
    (
        status,
        Json(ApiErrorResponse {
            error: error_kind(&err).into(),
            message: err.to_string(),
            details,
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlPlaneConfig;
    use crate::control::{NexusManager, ReplicaManager, TargetPublisher};
    use crate::engine::{InProcessEngine, IoEngineApi};
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const MB: u64 = 1024 * 1024;

    async fn rig() -> (Router, Arc<Registry>, Arc<InProcessEngine>) {
        let registry = Registry::new();
        let engine = InProcessEngine::new();
        let config = ControlPlaneConfig::default();
        for (node, endpoint) in [
            ("io-engine-1", "10.1.0.5:10124"),
            ("io-engine-2", "10.1.0.6:10124"),
            ("io-engine-3", "10.1.0.7:10124"),
        ] {
            engine.add_node(node, endpoint);
            registry.nodes.register(node, endpoint).unwrap();
            let node_id = NodeId::from(node);
            let pool_id = PoolId::from(format!("pool-{}", node));
            let state = engine
                .create_pool(&node_id, &pool_id, &["malloc:///disk0?size_mb=100".into()])
                .await
                .unwrap();
            registry
                .resources
                .insert_pool(Pool {
                    id: pool_id,
                    node: node_id,
                    disks: vec!["malloc:///disk0?size_mb=100".into()],
                    capacity_bytes: state.capacity_bytes,
                    used_bytes: state.used_bytes,
                    status: crate::resources::PoolStatus::Online,
                    created_at: Utc::now(),
                })
                .unwrap();
        }
        let pools = PoolService::new(registry.clone(), engine.clone(), config.node_conn_timeout);
        let replicas =
            ReplicaManager::new(registry.clone(), engine.clone(), config.node_conn_timeout);
        let nexuses = NexusManager::new(registry.clone(), engine.clone(), config.node_conn_timeout);
        let publisher = TargetPublisher::new(
            registry.clone(),
            engine.clone(),
            nexuses.clone(),
            config.node_conn_timeout,
        );
        let volumes = VolumeService::new(registry.clone(), replicas, nexuses, publisher);
        let router = RestRouter::new(registry.clone(), pools, volumes).build();
        (router, registry, engine)
    }

    async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_volume_lifecycle_over_http() {
        let (router, _registry, _engine) = rig().await;
        let uuid = VolumeId::new_random().to_string();

        let (status, body) = send(
            &router,
            "PUT",
            &format!("/v0/volumes/{}", uuid),
            Some(json!({"sizeBytes": 10 * MB, "numReplicas": 2})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["uuid"], uuid);
        assert_eq!(body["status"], "online");
        assert_eq!(body["numReplicas"], 2);
        assert_eq!(body["replicaTopology"].as_object().unwrap().len(), 2);
        assert!(body["target"].is_null());

        let (status, body) = send(&router, "GET", &format!("/v0/volumes/{}", uuid), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["uuid"], uuid);

        let (status, body) = send(&router, "GET", "/v0/volumes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _) = send(&router, "DELETE", &format!("/v0/volumes/{}", uuid), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(&router, "GET", &format!("/v0/volumes/{}", uuid), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn test_volume_validation_errors() {
        let (router, _registry, _engine) = rig().await;
        let uuid = VolumeId::new_random().to_string();

        let (status, body) = send(
            &router,
            "PUT",
            "/v0/volumes/not-a-uuid",
            Some(json!({"sizeBytes": 10 * MB, "numReplicas": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");

        let (status, body) = send(
            &router,
            "PUT",
            &format!("/v0/volumes/{}", uuid),
            Some(json!({"sizeBytes": 10 * MB, "numReplicas": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_spec");

        // four replicas cannot land on three nodes
        let (status, body) = send(
            &router,
            "PUT",
            &format!("/v0/volumes/{}", uuid),
            Some(json!({"sizeBytes": 10 * MB, "numReplicas": 4})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "unsatisfiable");
    }

    #[tokio::test]
    async fn test_target_publish_and_republish_flow() {
        let (router, _registry, _engine) = rig().await;
        let uuid = VolumeId::new_random().to_string();
        send(
            &router,
            "PUT",
            &format!("/v0/volumes/{}", uuid),
            Some(json!({"sizeBytes": 10 * MB, "numReplicas": 2})),
        )
        .await;

        let (status, body) = send(
            &router,
            "PUT",
            &format!("/v0/volumes/{}/target", uuid),
            Some(json!({"protocol": "nvmf"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let first_node = body["target"]["node"].as_str().unwrap().to_string();
        let uri = body["target"]["deviceUri"].as_str().unwrap();
        assert!(uri.contains(&format!("nqn.2019-05.io.blockplane:{}", uuid)));

        // publishing again without republish is a conflict
        let (status, body) = send(
            &router,
            "PUT",
            &format!("/v0/volumes/{}/target", uuid),
            Some(json!({"protocol": "nvmf"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "already_published");

        // with reuseExisting the repeat publish returns the standing target
        let (status, body) = send(
            &router,
            "PUT",
            &format!("/v0/volumes/{}/target", uuid),
            Some(json!({"reuseExisting": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["target"]["node"], first_node.as_str());

        // republish moves the target off the incumbent node
        let (status, body) = send(
            &router,
            "PUT",
            &format!("/v0/volumes/{}/target", uuid),
            Some(json!({"republish": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let second_node = body["target"]["node"].as_str().unwrap();
        assert_ne!(second_node, first_node);

        // both paths visible in the same subsystem, on distinct addresses
        let (status, body) =
            send(&router, "GET", &format!("/v0/volumes/{}/paths", uuid), None).await;
        assert_eq!(status, StatusCode::OK);
        let paths = body.as_array().unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0]["name"], paths[1]["name"]);
        assert_ne!(paths[0]["address"], paths[1]["address"]);

        let (status, body) = send(
            &router,
            "DELETE",
            &format!("/v0/volumes/{}/shutdown_targets", uuid),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["destroyed"], 1);

        let (status, body) = send(
            &router,
            "DELETE",
            &format!("/v0/volumes/{}/target", uuid),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["target"].is_null());

        let (status, body) = send(
            &router,
            "DELETE",
            &format!("/v0/volumes/{}/target", uuid),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "not_published");
    }

    #[tokio::test]
    async fn test_publish_on_dead_node_maps_to_unavailable() {
        let (router, registry, engine) = rig().await;
        let uuid = VolumeId::new_random().to_string();
        send(
            &router,
            "PUT",
            &format!("/v0/volumes/{}", uuid),
            Some(json!({"sizeBytes": 10 * MB, "numReplicas": 1})),
        )
        .await;

        let dead = NodeId::from("io-engine-3");
        engine.kill_node(&dead);
        registry.nodes.mark_offline(&dead).unwrap();

        let (status, body) = send(
            &router,
            "PUT",
            &format!("/v0/volumes/{}/target", uuid),
            Some(json!({"node": "io-engine-3"})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "unavailable");
        assert_eq!(body["details"], "transient, retry the request");
    }

    #[tokio::test]
    async fn test_replica_count_endpoint() {
        let (router, _registry, _engine) = rig().await;
        let uuid = VolumeId::new_random().to_string();
        send(
            &router,
            "PUT",
            &format!("/v0/volumes/{}", uuid),
            Some(json!({"sizeBytes": 10 * MB, "numReplicas": 2})),
        )
        .await;

        let (status, body) = send(
            &router,
            "PUT",
            &format!("/v0/volumes/{}/replica_count", uuid),
            Some(json!({"count": 3})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["numReplicas"], 3);
        // desired count leads, convergence catches up in the background
        assert_eq!(body["status"], "degraded");

        send(
            &router,
            "PUT",
            &format!("/v0/volumes/{}/target", uuid),
            Some(json!({})),
        )
        .await;
        let (status, body) = send(
            &router,
            "PUT",
            &format!("/v0/volumes/{}/replica_count", uuid),
            Some(json!({"count": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_spec");
    }

    #[tokio::test]
    async fn test_pool_endpoints() {
        let (router, _registry, _engine) = rig().await;

        let (status, body) = send(&router, "GET", "/v0/pools", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 3);

        let (status, body) = send(
            &router,
            "PUT",
            "/v0/pools/io-engine-1/pool-extra",
            Some(json!({"disks": ["malloc:///disk1?size_mb=50"]})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["node"], "io-engine-1");
        assert_eq!(body["capacityBytes"], 50 * MB);
        assert_eq!(body["status"], "online");

        let (status, body) = send(
            &router,
            "PUT",
            "/v0/pools/no-such-node/pool-nowhere",
            Some(json!({"disks": ["malloc:///disk0"]})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        // a pool with residents refuses a plain delete
        let uuid = VolumeId::new_random().to_string();
        send(
            &router,
            "PUT",
            &format!("/v0/volumes/{}", uuid),
            Some(json!({"sizeBytes": 10 * MB, "numReplicas": 3})),
        )
        .await;
        let (status, body) = send(&router, "DELETE", "/v0/pools/pool-io-engine-1", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "in_use");

        let (status, _) = send(
            &router,
            "DELETE",
            "/v0/pools/pool-io-engine-1?cascade=true",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send(&router, "GET", "/v0/pools/pool-io-engine-1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_node_endpoints_and_health() {
        let (router, registry, _engine) = rig().await;

        let (status, body) = send(&router, "GET", "/v0/nodes", None).await;
        assert_eq!(status, StatusCode::OK);
        let nodes = body.as_array().unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0]["id"], "io-engine-1");
        assert_eq!(nodes[0]["status"], "online");

        let (status, body) = send(&router, "GET", "/v0/nodes/io-engine-2", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["endpoint"], "10.1.0.6:10124");

        let (status, _) = send(&router, "GET", "/v0/nodes/io-engine-9", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&router, "GET", "/ready", None).await;
        assert_eq!(status, StatusCode::OK);

        // readiness fails with every node offline
        for node in registry.nodes.all_node_ids() {
            registry.nodes.mark_offline(&node).unwrap();
        }
        let (status, _) = send(&router, "GET", "/ready", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
