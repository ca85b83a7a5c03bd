//! Storage Cluster Operator
//!
//! Reconciles `StorageCluster` resources into running storage clusters:
//! one cluster per namespace, created locally or connected to externally,
//! upgraded behind a version gate and drained before deletion.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_cluster_operator::adapters::{
    cluster_events, default_subcontrollers, CliDaemonInspector, ConfigMapCsiStore, DeviceWatch,
    JobVersionProbe, KubeAttachmentSource, KubeClusterStore, KubeConnectionSource,
    ManifestDeployer, CSI_CONFIG_MAP,
};
use storage_cluster_operator::domain::ClusterAddedHook;
use storage_cluster_operator::{
    hotplug_enabled, ClusterRegistry, ControllerConfig, ControllerMetrics, Error, EventRouter,
    Reconciler, ReconcilerDeps, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage Cluster Operator - lifecycle controller for storage clusters
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace the operator runs in
    #[arg(long, env = "POD_NAMESPACE", default_value = "storage-system")]
    operator_namespace: String,

    /// Only watch StorageClusters in this namespace (empty watches all)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    watch_namespace: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Set to `true` to ignore device inventory changes
    #[arg(long, env = "DISABLE_DEVICE_HOTPLUG")]
    disable_device_hotplug: Option<String>,

    /// Label selector of the device discovery config maps
    #[arg(long, env = "DISCOVERY_LABEL_SELECTOR", default_value = "app=storage-discover")]
    discovery_label_selector: String,

    /// Config map holding the CSI cluster config
    #[arg(long, env = "CSI_CONFIG_MAP", default_value = CSI_CONFIG_MAP)]
    csi_config_map: String,

    /// Engine command-line client used to query the daemons
    #[arg(long, env = "DAEMON_BINARY", default_value = "ceph")]
    daemon_binary: String,

    /// Directory for per-cluster connection config files
    #[arg(long, env = "CONFIG_DIR", default_value = "/var/lib/storage-operator")]
    config_dir: String,

    /// Timeout of a single daemon command in seconds
    #[arg(long, env = "DAEMON_TIMEOUT", default_value = "60")]
    daemon_timeout_secs: u64,

    /// Poll interval of the version probe job in seconds
    #[arg(long, env = "PROBE_POLL_INTERVAL", default_value = "5")]
    probe_poll_secs: u64,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let device_hotplug = hotplug_enabled(args.disable_device_hotplug.as_deref());
    let watch_namespace = Some(args.watch_namespace.as_str()).filter(|ns| !ns.is_empty());

    info!("Starting Storage Cluster Operator");
    info!("  Version: {}", storage_cluster_operator::VERSION);
    info!("  Operator namespace: {}", args.operator_namespace);
    info!("  Watch namespace: {}", watch_namespace.unwrap_or("<all>"));
    info!("  Device hotplug: {}", device_hotplug);

    let metrics = ControllerMetrics::new()?;
    metrics.register(prometheus::default_registry())?;

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes API");

    let config = ControllerConfig {
        operator_namespace: args.operator_namespace.clone(),
        device_hotplug,
        ..Default::default()
    };

    let deps = ReconcilerDeps {
        store: Arc::new(KubeClusterStore::new(client.clone())),
        probe: Arc::new(JobVersionProbe::new(
            client.clone(),
            Duration::from_secs(args.probe_poll_secs),
        )),
        deployer: Arc::new(ManifestDeployer::new(client.clone())),
        connection: Arc::new(KubeConnectionSource::new(client.clone(), &args.config_dir)),
        inspector: Arc::new(CliDaemonInspector::new(
            &args.daemon_binary,
            &args.config_dir,
            Duration::from_secs(args.daemon_timeout_secs),
        )),
        attachments: Arc::new(KubeAttachmentSource::new(client.clone())),
        csi_store: Arc::new(ConfigMapCsiStore::new(
            client.clone(),
            &args.operator_namespace,
            &args.csi_config_map,
        )),
        subcontrollers: default_subcontrollers(client.clone()),
        added_hook: Some(Arc::new(log_cluster_added) as ClusterAddedHook),
    };

    let reconciler = Arc::new(Reconciler::new(
        config,
        Arc::new(ClusterRegistry::new()),
        deps,
        metrics,
    ));
    let router = EventRouter::new(reconciler);

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
        }
        signal.cancel();
    });

    let devices = device_hotplug.then(|| DeviceWatch {
        namespace: args.operator_namespace.clone(),
        label_selector: args.discovery_label_selector.clone(),
    });
    let events = cluster_events(client, watch_namespace, devices);
    router.run(events, shutdown).await;

    info!("Operator shutdown complete");
    Ok(())
}

/// Hook run for every accepted cluster; this binary only logs it
fn log_cluster_added(external: bool) -> Result<()> {
    info!("Cluster accepted (external: {})", external);
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

    let filter = ["hyper=warn", "kube=info", "tower=warn"]
        .iter()
        .filter_map(|directive| directive.parse::<Directive>().ok())
        .fold(
            EnvFilter::from_default_env().add_directive(level.into()),
            |filter, directive| filter.add_directive(directive),
        );

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

fn text_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => text_response(StatusCode::OK, "ok"),
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

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

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    match encoder.encode(&prometheus::gather(), &mut buffer) {
                        Ok(()) => {
                            let mut response = Response::new(Body::from(buffer));
                            response.headers_mut().insert(
                                CONTENT_TYPE,
                                HeaderValue::from_static(prometheus::TEXT_FORMAT),
                            );
                            response
                        }
                        Err(e) => {
                            error!("Failed to encode metrics: {}", e);
                            text_response(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
                        }
                    }
                }
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
