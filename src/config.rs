//! Controller configuration
//!
//! All tunables of the provisioning controller live in [`ControllerConfig`].
//! Defaults match the long-standing values of the external provisioner
//! library so deployments can leave most of them alone.

use crate::error::{Error, Result};
use std::time::Duration;

// =============================================================================
// Defaults
// =============================================================================

/// How often caches are relisted and every object re-enqueued
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(15 * 60);
/// Claim and volume workers, each
pub const DEFAULT_THREADINESS: usize = 4;
pub const DEFAULT_EXPONENTIAL_BACKOFF_ON_ERROR: bool = true;
pub const DEFAULT_CREATE_PROVISIONED_PV_RETRY_COUNT: u32 = 5;
pub const DEFAULT_CREATE_PROVISIONED_PV_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_FAILED_PROVISION_THRESHOLD: u32 = 15;
pub const DEFAULT_FAILED_DELETE_THRESHOLD: u32 = 15;
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(2);
pub const DEFAULT_TERM_LIMIT: Duration = Duration::from_secs(30);
/// Zero disables the metrics server
pub const DEFAULT_METRICS_PORT: u16 = 0;
pub const DEFAULT_METRICS_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_METRICS_PATH: &str = "/metrics";

// =============================================================================
// Leader Election Configuration
// =============================================================================

/// Timing of the per-claim leader election
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderElectionConfig {
    /// How long a non-leader waits after the last observed change of the
    /// record before it may take the lock over
    pub lease_duration: Duration,
    /// How long the leader keeps retrying a failed renewal
    pub renew_deadline: Duration,
    /// Wait between acquire/renew attempts
    pub retry_period: Duration,
    /// Longest a leader may keep the lock; zero means no limit
    pub term_limit: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
            term_limit: DEFAULT_TERM_LIMIT,
        }
    }
}

impl LeaderElectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lease_duration <= self.renew_deadline {
            return Err(Error::Configuration(
                "lease duration must be greater than renew deadline".into(),
            ));
        }
        if self.renew_deadline <= self.retry_period {
            return Err(Error::Configuration(
                "renew deadline must be greater than retry period".into(),
            ));
        }
        if self.retry_period.is_zero() {
            return Err(Error::Configuration("retry period must be positive".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Metrics Configuration
// =============================================================================

/// Where the metrics endpoint is served
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsConfig {
    pub port: u16,
    pub address: String,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_METRICS_PORT,
            address: DEFAULT_METRICS_ADDRESS.to_string(),
            path: DEFAULT_METRICS_PATH.to_string(),
        }
    }
}

impl MetricsConfig {
    pub fn enabled(&self) -> bool {
        self.port > 0
    }
}

// =============================================================================
// Controller Configuration
// =============================================================================

/// Configuration for the provisioning controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Name this controller answers to in StorageClasses and claim
    /// annotations, and stamps on the volumes it creates
    pub provisioner_name: String,
    pub resync_period: Duration,
    pub threadiness: usize,
    pub exponential_backoff_on_error: bool,
    /// Attempts at saving a provisioned PV, and at cleaning up after that fails
    pub create_provisioned_pv_retry_count: u32,
    pub create_provisioned_pv_interval: Duration,
    pub failed_provision_threshold: u32,
    pub failed_delete_threshold: u32,
    /// Also reclaim volumes in phase `Failed`, not only `Released`
    pub reclaim_failed_volumes: bool,
    pub leader_election: LeaderElectionConfig,
    pub metrics: MetricsConfig,
}

impl ControllerConfig {
    pub fn new(provisioner_name: impl Into<String>) -> Self {
        Self {
            provisioner_name: provisioner_name.into(),
            resync_period: DEFAULT_RESYNC_PERIOD,
            threadiness: DEFAULT_THREADINESS,
            exponential_backoff_on_error: DEFAULT_EXPONENTIAL_BACKOFF_ON_ERROR,
            create_provisioned_pv_retry_count: DEFAULT_CREATE_PROVISIONED_PV_RETRY_COUNT,
            create_provisioned_pv_interval: DEFAULT_CREATE_PROVISIONED_PV_INTERVAL,
            failed_provision_threshold: DEFAULT_FAILED_PROVISION_THRESHOLD,
            failed_delete_threshold: DEFAULT_FAILED_DELETE_THRESHOLD,
            reclaim_failed_volumes: false,
            leader_election: LeaderElectionConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }

    /// Reject settings the controller cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.provisioner_name.trim().is_empty() {
            return Err(Error::Configuration("provisioner name must be set".into()));
        }
        if self.threadiness == 0 {
            return Err(Error::Configuration("threadiness must be at least 1".into()));
        }
        if self.create_provisioned_pv_retry_count == 0 {
            return Err(Error::Configuration(
                "create provisioned PV retry count must be at least 1".into(),
            ));
        }
        if self.resync_period.is_zero() {
            return Err(Error::Configuration("resync period must be positive".into()));
        }
        if !self.metrics.path.starts_with('/') {
            return Err(Error::Configuration(format!(
                "metrics path {:?} must start with '/'",
                self.metrics.path
            )));
        }
        self.leader_election.validate()
    }
}
