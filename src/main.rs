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

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use blockplane::{
    spawn_heartbeat_pump, ApiServer, ApiServerConfig, ControlPlaneConfig, Error, InProcessEngine,
    IoEngineRef, NexusManager, PoolService, Registry, ReplicaManager, Result, StatePoller,
    TargetPublisher, VolumeReconciler, VolumeService,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Blockplane - Control Plane for Replicated Block Volumes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Number of emulated io-engine nodes to seed at startup
    #[arg(long, env = "ENGINE_NODES", default_value = "3")]
    engine_nodes: u32,

    /// How often observed engine state is refreshed into the registry
    #[arg(long, env = "CACHE_PERIOD", default_value = "30s")]
    cache_period: String,

    /// How often the reconciler walks all volumes
    #[arg(long, env = "RECONCILE_PERIOD", default_value = "30s")]
    reconcile_period: String,

    /// Grace period before a faulted nexus child is evicted and replaced
    #[arg(long, env = "FAULTED_CHILD_WAIT_PERIOD", default_value = "10s")]
    faulted_child_wait_period: String,

    /// Upper bound on any single engine call to a node
    #[arg(long, env = "NODE_CONN_TIMEOUT", default_value = "1s")]
    node_conn_timeout: String,

    /// Expected node heartbeat cadence
    #[arg(long, env = "HEARTBEAT_INTERVAL", default_value = "5s")]
    heartbeat_interval: String,

    /// Heartbeat age after which a node is marked offline (default: 3x interval)
    #[arg(long, env = "HEARTBEAT_TIMEOUT")]
    heartbeat_timeout: Option<String>,

    /// How long a target path may stay connecting before it is flagged
    #[arg(long, env = "PATH_CONNECT_TIMEOUT", default_value = "10s")]
    path_connect_timeout: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting Blockplane Volume Control Plane");
    info!("  Version: {}", blockplane::VERSION);
    info!("  REST API: {}", args.api_addr);
    info!("  Engine nodes: {}", args.engine_nodes);

    let config = ControlPlaneConfig::from_strs(
        &args.cache_period,
        &args.reconcile_period,
        &args.faulted_child_wait_period,
        &args.node_conn_timeout,
        &args.heartbeat_interval,
        args.heartbeat_timeout.as_deref(),
        &args.path_connect_timeout,
    )?;
    info!("  Cache period: {:?}", config.cache_period);
    info!("  Reconcile period: {:?}", config.reconcile_period);

    // Registry and the emulated engine cluster
    let registry = Registry::new();
    let engine = InProcessEngine::new();
    for i in 1..=args.engine_nodes {
        let node = format!("io-engine-{}", i);
        let endpoint = format!("10.1.0.{}:10124", 4 + i);
        engine.add_node(node.as_str(), endpoint.as_str());
        registry.nodes.register(node.as_str(), endpoint.as_str())?;
    }
    info!(nodes = args.engine_nodes, "Engine cluster seeded");

    let engine_ref: IoEngineRef = engine.clone();

    // Control plane services
    let replicas = ReplicaManager::new(
        registry.clone(),
        engine_ref.clone(),
        config.node_conn_timeout,
    );
    let nexuses = NexusManager::new(
        registry.clone(),
        engine_ref.clone(),
        config.node_conn_timeout,
    );
    let publisher = TargetPublisher::new(
        registry.clone(),
        engine_ref.clone(),
        nexuses.clone(),
        config.node_conn_timeout,
    );
    let volumes = VolumeService::new(
        registry.clone(),
        replicas.clone(),
        nexuses.clone(),
        publisher.clone(),
    );
    let pools = PoolService::new(
        registry.clone(),
        engine_ref.clone(),
        config.node_conn_timeout,
    );

    // Background loops
    let cancel = CancellationToken::new();
    spawn_heartbeat_pump(
        engine.clone(),
        registry.nodes.clone(),
        config.heartbeat_interval,
        cancel.clone(),
    );
    registry.nodes.spawn_watchdog(
        config.heartbeat_interval,
        config.heartbeat_timeout,
        cancel.clone(),
    );

    let poller = StatePoller::new(registry.clone(), engine_ref.clone(), config.clone());
    poller.spawn(cancel.clone());

    let reconciler = VolumeReconciler::new(
        registry.clone(),
        engine_ref.clone(),
        replicas.clone(),
        nexuses.clone(),
        volumes.clone(),
        config.clone(),
    );
    reconciler.spawn(cancel.clone());
    info!("Reconciliation loops started");

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_registry = registry.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_registry).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Create the API server
    let api_config = ApiServerConfig {
        rest_addr: args
            .api_addr
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid REST API address: {}", e)))?,
    };
    let api_server = Arc::new(ApiServer::new(api_config, registry, pools, volumes));

    // Shut everything down on ctrl-c
    {
        let api_server = api_server.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                cancel.cancel();
                api_server.shutdown();
            }
        });
    }

    info!("Starting REST API server");
    api_server.run().await?;
    cancel.cancel();

    info!("Control plane shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("tower=warn".parse().unwrap())
        .add_directive("axum=info".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" => Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from("ok"))
                    .unwrap(),
                "/readyz" => Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from("ok"))
                    .unwrap(),
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("not found"))
                    .unwrap(),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid health server address: {}", e)))?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

/// Gauges refreshed from the registry on every scrape, plus lifetime
/// counters caught up from the registry's cumulative stats
#[derive(Clone)]
struct ControlPlaneMetrics {
    nodes_total: prometheus::Gauge,
    nodes_online: prometheus::Gauge,
    pools: prometheus::Gauge,
    volumes: prometheus::Gauge,
    replicas: prometheus::Gauge,
    nexuses: prometheus::Gauge,
    paths: prometheus::Gauge,
    replicas_created: prometheus::IntCounter,
    replicas_destroyed: prometheus::IntCounter,
    nexuses_created: prometheus::IntCounter,
    nexuses_destroyed: prometheus::IntCounter,
    volumes_created: prometheus::IntCounter,
    volumes_destroyed: prometheus::IntCounter,
    offline_transitions: prometheus::IntCounter,
}

impl ControlPlaneMetrics {
    fn register() -> Result<Self> {
        let reg =
            |e: prometheus::Error| Error::Internal(format!("Failed to register metrics: {}", e));
        Ok(Self {
            nodes_total: prometheus::register_gauge!(
                "blockplane_nodes_total",
                "Registered io-engine nodes"
            )
            .map_err(reg)?,
            nodes_online: prometheus::register_gauge!(
                "blockplane_nodes_online",
                "Registered io-engine nodes currently online"
            )
            .map_err(reg)?,
            pools: prometheus::register_gauge!(
                "blockplane_pools_total",
                "Pools known to the control plane"
            )
            .map_err(reg)?,
            volumes: prometheus::register_gauge!(
                "blockplane_volumes_total",
                "Volume specs in the registry"
            )
            .map_err(reg)?,
            replicas: prometheus::register_gauge!(
                "blockplane_replicas_total",
                "Replica records in the registry"
            )
            .map_err(reg)?,
            nexuses: prometheus::register_gauge!(
                "blockplane_nexuses_total",
                "Nexus records in the registry"
            )
            .map_err(reg)?,
            paths: prometheus::register_gauge!(
                "blockplane_paths_total",
                "Host paths across all published volumes"
            )
            .map_err(reg)?,
            replicas_created: prometheus::register_int_counter!(
                "blockplane_replicas_created_total",
                "Replicas created over the process lifetime"
            )
            .map_err(reg)?,
            replicas_destroyed: prometheus::register_int_counter!(
                "blockplane_replicas_destroyed_total",
                "Replicas destroyed over the process lifetime"
            )
            .map_err(reg)?,
            nexuses_created: prometheus::register_int_counter!(
                "blockplane_nexuses_created_total",
                "Nexuses created over the process lifetime"
            )
            .map_err(reg)?,
            nexuses_destroyed: prometheus::register_int_counter!(
                "blockplane_nexuses_destroyed_total",
                "Nexuses destroyed over the process lifetime"
            )
            .map_err(reg)?,
            volumes_created: prometheus::register_int_counter!(
                "blockplane_volumes_created_total",
                "Volumes created over the process lifetime"
            )
            .map_err(reg)?,
            volumes_destroyed: prometheus::register_int_counter!(
                "blockplane_volumes_destroyed_total",
                "Volumes destroyed over the process lifetime"
            )
            .map_err(reg)?,
            offline_transitions: prometheus::register_int_counter!(
                "blockplane_node_offline_transitions_total",
                "Times any node went from online to offline"
            )
            .map_err(reg)?,
        })
    }

    fn update(&self, registry: &Registry) {
        let nodes = registry.nodes.stats();
        let resources = registry.resources.stats();
        self.nodes_total.set(nodes.total_nodes as f64);
        self.nodes_online.set(nodes.online_nodes as f64);
        self.pools.set(resources.pools as f64);
        self.volumes.set(resources.volumes as f64);
        self.replicas.set(resources.replicas as f64);
        self.nexuses.set(resources.nexuses as f64);
        self.paths.set(resources.paths as f64);
        Self::advance(&self.replicas_created, resources.replicas_created);
        Self::advance(&self.replicas_destroyed, resources.replicas_destroyed);
        Self::advance(&self.nexuses_created, resources.nexuses_created);
        Self::advance(&self.nexuses_destroyed, resources.nexuses_destroyed);
        Self::advance(&self.volumes_created, resources.volumes_created);
        Self::advance(&self.volumes_destroyed, resources.volumes_destroyed);
        Self::advance(&self.offline_transitions, nodes.offline_transitions);
    }

    /// Catch a counter up to a cumulative total; scrapes are assumed serial
    fn advance(counter: &prometheus::IntCounter, total: u64) {
        let seen = counter.get();
        if total > seen {
            counter.inc_by(total - seen);
        }
    }
}

async fn run_metrics_server(addr: &str, registry: Arc<Registry>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let metrics = ControlPlaneMetrics::register()?;

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            metrics.update(&registry);

                            let encoder = TextEncoder::new();
                            let metric_families = prometheus::gather();
                            let mut buffer = Vec::new();
                            encoder.encode(&metric_families, &mut buffer).unwrap();

                            Response::builder()
                                .status(StatusCode::OK)
                                .header("Content-Type", encoder.format_type())
                                .body(Body::from(buffer))
                                .unwrap()
                        }
                        _ => Response::builder()
                            .status(StatusCode::NOT_FOUND)
                            .body(Body::from("not found"))
                            .unwrap(),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
