//! Controller metrics
//!
//! Provision and delete counters and latencies, kept in a registry owned by
//! the controller and optionally served over HTTP in the Prometheus text
//! format.

use crate::config::MetricsConfig;
use crate::error::{Error, Result};
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

const SUBSYSTEM_CLAIM: &str = "persistentvolumeclaim";
const SUBSYSTEM_VOLUME: &str = "persistentvolume";
const NAMESPACE: &str = "controller";

pub struct ControllerMetrics {
    registry: Registry,
    provision_total: IntCounterVec,
    provision_failed_total: IntCounterVec,
    provision_duration_seconds: HistogramVec,
    delete_total: IntCounterVec,
    delete_failed_total: IntCounterVec,
    delete_duration_seconds: HistogramVec,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let provision_total = IntCounterVec::new(
            Opts::new("provision_total", "Total number of persistent volumes provisioned successfully.")
                .namespace(NAMESPACE)
                .subsystem(SUBSYSTEM_CLAIM),
            &["class"],
        )?;
        let provision_failed_total = IntCounterVec::new(
            Opts::new("provision_failed_total", "Total number of persistent volume provision failed attempts.")
                .namespace(NAMESPACE)
                .subsystem(SUBSYSTEM_CLAIM),
            &["class"],
        )?;
        let provision_duration_seconds = HistogramVec::new(
            HistogramOpts::new("provision_duration_seconds", "Latency in seconds to provision persistent volumes.")
                .namespace(NAMESPACE)
                .subsystem(SUBSYSTEM_CLAIM),
            &["class"],
        )?;
        let delete_total = IntCounterVec::new(
            Opts::new("delete_total", "Total number of persistent volumes deleted successfully.")
                .namespace(NAMESPACE)
                .subsystem(SUBSYSTEM_VOLUME),
            &["class", "volume_mode"],
        )?;
        let delete_failed_total = IntCounterVec::new(
            Opts::new("delete_failed_total", "Total number of persistent volume delete failed attempts.")
                .namespace(NAMESPACE)
                .subsystem(SUBSYSTEM_VOLUME),
            &["class", "volume_mode"],
        )?;
        let delete_duration_seconds = HistogramVec::new(
            HistogramOpts::new("delete_duration_seconds", "Latency in seconds to delete persistent volumes.")
                .namespace(NAMESPACE)
                .subsystem(SUBSYSTEM_VOLUME),
            &["class", "volume_mode"],
        )?;

        registry.register(Box::new(provision_total.clone()))?;
        registry.register(Box::new(provision_failed_total.clone()))?;
        registry.register(Box::new(provision_duration_seconds.clone()))?;
        registry.register(Box::new(delete_total.clone()))?;
        registry.register(Box::new(delete_failed_total.clone()))?;
        registry.register(Box::new(delete_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            provision_total,
            provision_failed_total,
            provision_duration_seconds,
            delete_total,
            delete_failed_total,
            delete_duration_seconds,
        })
    }

    /// Count one provision attempt of a claim of `class`
    pub fn record_provision(&self, class: &str, succeeded: bool, elapsed: Duration) {
        if succeeded {
            self.provision_total.with_label_values(&[class]).inc();
            self.provision_duration_seconds
                .with_label_values(&[class])
                .observe(elapsed.as_secs_f64());
        } else {
            self.provision_failed_total.with_label_values(&[class]).inc();
        }
    }

    /// Count one delete attempt of a volume of `class`
    pub fn record_delete(&self, class: &str, volume_mode: &str, succeeded: bool, elapsed: Duration) {
        let labels = [class, volume_mode];
        if succeeded {
            self.delete_total.with_label_values(&labels).inc();
            self.delete_duration_seconds
                .with_label_values(&labels)
                .observe(elapsed.as_secs_f64());
        } else {
            self.delete_failed_total.with_label_values(&labels).inc();
        }
    }

    pub fn provisioned(&self, class: &str) -> u64 {
        self.provision_total.with_label_values(&[class]).get()
    }

    pub fn provision_failures(&self, class: &str) -> u64 {
        self.provision_failed_total.with_label_values(&[class]).get()
    }

    pub fn deleted(&self, class: &str, volume_mode: &str) -> u64 {
        self.delete_total.with_label_values(&[class, volume_mode]).get()
    }

    pub fn delete_failures(&self, class: &str, volume_mode: &str) -> u64 {
        self.delete_failed_total
            .with_label_values(&[class, volume_mode])
            .get()
    }

    /// Text exposition of every metric in the registry
    pub fn encode(&self) -> Result<Vec<u8>> {
        use prometheus::{Encoder, TextEncoder};

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

impl std::fmt::Debug for ControllerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerMetrics").finish_non_exhaustive()
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

/// Socket the metrics server binds; IPv6 addresses need no brackets
fn bind_address(config: &MetricsConfig) -> Result<SocketAddr> {
    let ip: IpAddr = config.address.parse().map_err(|e| {
        Error::Configuration(format!(
            "Invalid metrics server address {:?}: {}",
            config.address, e
        ))
    })?;
    Ok(SocketAddr::new(ip, config.port))
}

/// Serve `metrics` on the configured address and path until `stop` fires
pub async fn serve(
    config: MetricsConfig,
    metrics: Arc<ControllerMetrics>,
    stop: CancellationToken,
) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let addr = bind_address(&config)?;
    info!("Metrics server listening on {}{}", addr, config.path);
    let path = Arc::new(config.path);

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        let path = path.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                let path = path.clone();
                async move {
                    let mut response = Response::new(Body::empty());
                    if req.uri().path() != path.as_str() {
                        *response.status_mut() = StatusCode::NOT_FOUND;
                        *response.body_mut() = Body::from("not found");
                        return Ok::<_, std::convert::Infallible>(response);
                    }
                    match metrics.encode() {
                        Ok(buffer) => {
                            response.headers_mut().insert(
                                hyper::header::CONTENT_TYPE,
                                hyper::header::HeaderValue::from_static(
                                    "text/plain; version=0.0.4",
                                ),
                            );
                            *response.body_mut() = Body::from(buffer);
                        }
                        Err(e) => {
                            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                            *response.body_mut() = Body::from(e.to_string());
                        }
                    }
                    Ok(response)
                }
            }))
        }
    });

    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
