//! External Provisioner
//!
//! Runs the provision controller with the bundled host-path provisioner,
//! plus a health server for liveness and readiness probes.

use clap::{ArgAction, Parser};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use external_provisioner::{
    ControllerConfig, Error, HostPathProvisioner, KubeClusterApi, KubeEventRecorder,
    LeaderElectionConfig, MetricsConfig, ProvisionController, RegisteredProvisioner, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// External Provisioner - dynamic PersistentVolume provisioning
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name StorageClasses use to select this provisioner
    #[arg(long, env = "PROVISIONER_NAME", default_value = "example.com/hostpath")]
    provisioner: String,

    /// Directory volumes are created under
    #[arg(long, env = "HOSTPATH_DIR", default_value = "/var/lib/external-provisioner")]
    hostpath_dir: String,

    /// Name of the node this replica runs on; identifies the volumes it creates
    #[arg(long, env = "NODE_NAME", default_value = "localhost")]
    node_name: String,

    /// Workers per queue
    #[arg(long, env = "THREADINESS", default_value_t = 4)]
    threadiness: usize,

    /// Cache resync period in seconds
    #[arg(long, env = "RESYNC_PERIOD_SECS", default_value_t = 900)]
    resync_period_secs: u64,

    /// Back off exponentially when retrying failed work
    #[arg(long, env = "EXPONENTIAL_BACKOFF_ON_ERROR", default_value_t = true, action = ArgAction::Set)]
    exponential_backoff_on_error: bool,

    /// Attempts at saving a provisioned volume
    #[arg(long, env = "CREATE_PROVISIONED_PV_RETRY_COUNT", default_value_t = 5)]
    create_provisioned_pv_retry_count: u32,

    /// Seconds between attempts at saving a provisioned volume
    #[arg(long, env = "CREATE_PROVISIONED_PV_INTERVAL_SECS", default_value_t = 10)]
    create_provisioned_pv_interval_secs: u64,

    /// Failed provisioning attempts per claim before giving up; 0 retries forever
    #[arg(long, env = "FAILED_PROVISION_THRESHOLD", default_value_t = 15)]
    failed_provision_threshold: u32,

    /// Failed deletion attempts per volume before giving up; 0 retries forever
    #[arg(long, env = "FAILED_DELETE_THRESHOLD", default_value_t = 15)]
    failed_delete_threshold: u32,

    /// Also delete volumes in phase Failed
    #[arg(long, env = "RECLAIM_FAILED_VOLUMES")]
    reclaim_failed_volumes: bool,

    /// Claim lease duration in seconds
    #[arg(long, env = "LEASE_DURATION_SECS", default_value_t = 15)]
    lease_duration_secs: u64,

    /// Claim lease renew deadline in seconds
    #[arg(long, env = "RENEW_DEADLINE_SECS", default_value_t = 10)]
    renew_deadline_secs: u64,

    /// Seconds between lease acquire and renew attempts
    #[arg(long, env = "RETRY_PERIOD_SECS", default_value_t = 2)]
    retry_period_secs: u64,

    /// Longest a replica may hold a claim lease, in seconds; 0 for no limit
    #[arg(long, env = "TERM_LIMIT_SECS", default_value_t = 30)]
    term_limit_secs: u64,

    /// Metrics port; 0 disables the metrics server
    #[arg(long, env = "METRICS_PORT", default_value_t = 0)]
    metrics_port: u16,

    /// Metrics bind address
    #[arg(long, env = "METRICS_ADDRESS", default_value = "0.0.0.0")]
    metrics_address: String,

    /// Metrics HTTP path
    #[arg(long, env = "METRICS_PATH", default_value = "/metrics")]
    metrics_path: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn controller_config(&self) -> ControllerConfig {
        let mut config = ControllerConfig::new(self.provisioner.clone());
        config.threadiness = self.threadiness;
        config.resync_period = Duration::from_secs(self.resync_period_secs);
        config.exponential_backoff_on_error = self.exponential_backoff_on_error;
        config.create_provisioned_pv_retry_count = self.create_provisioned_pv_retry_count;
        config.create_provisioned_pv_interval =
            Duration::from_secs(self.create_provisioned_pv_interval_secs);
        config.failed_provision_threshold = self.failed_provision_threshold;
        config.failed_delete_threshold = self.failed_delete_threshold;
        config.reclaim_failed_volumes = self.reclaim_failed_volumes;
        config.leader_election = LeaderElectionConfig {
            lease_duration: Duration::from_secs(self.lease_duration_secs),
            renew_deadline: Duration::from_secs(self.renew_deadline_secs),
            retry_period: Duration::from_secs(self.retry_period_secs),
            term_limit: Duration::from_secs(self.term_limit_secs),
        };
        config.metrics = MetricsConfig {
            port: self.metrics_port,
            address: self.metrics_address.clone(),
            path: self.metrics_path.clone(),
        };
        config
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting External Provisioner");
    info!("  Version: {}", external_provisioner::VERSION);
    info!("  Provisioner: {}", args.provisioner);
    info!("  Volume directory: {}", args.hostpath_dir);
    info!("  Node: {}", args.node_name);

    let config = args.controller_config();
    let client = kube::Client::try_default().await?;

    let provisioner = HostPathProvisioner::new(&args.hostpath_dir, args.node_name.clone());
    let ctrl = ProvisionController::new(
        config,
        RegisteredProvisioner::new(Arc::new(provisioner)),
        Arc::new(KubeClusterApi::new(client.clone())),
        Arc::new(KubeEventRecorder::new(
            client.clone(),
            &args.provisioner,
            &args.node_name,
        )),
    )?;
    info!("Controller identity: {}", ctrl.identity());

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_ctrl = ctrl.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ctrl).await {
            error!("Health server error: {}", e);
        }
    });

    let signal_ctrl = ctrl.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal_ctrl.shutdown();
    });

    ctrl.run(client).await?;

    info!("Provisioner shutdown complete");
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

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

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

async fn run_health_server(addr: &str, ctrl: Arc<ProvisionController>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let stop = ctrl.stop_token();
    let make_svc = make_service_fn(move |_conn| {
        let ctrl = ctrl.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ctrl = ctrl.clone();
                async move {
                    let mut response = Response::new(Body::from("ok"));
                    match req.uri().path() {
                        "/healthz" | "/livez" => {}
                        "/readyz" if ctrl.has_synced() => {}
                        "/readyz" => {
                            *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                            *response.body_mut() = Body::from("caches not synced");
                        }
                        _ => {
                            *response.status_mut() = StatusCode::NOT_FOUND;
                            *response.body_mut() = Body::from("not found");
                        }
                    }
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid health server address: {}", e)))?;

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}
