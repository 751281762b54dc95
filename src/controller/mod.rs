//! Provision Controller
//!
//! Watches claims, volumes and storage classes, and drives the registered
//! [`Provisioner`](crate::domain::Provisioner):
//!
//! - claims that ask for this provisioner get a volume, provisioned by
//!   whichever replica wins the claim's lease ([`election`])
//! - released volumes this provisioner created are deleted when their
//!   reclaim policy says so ([`delete`])
//!
//! Both kinds of work flow through their own [`WorkQueue`] with rate-limited
//! retries, bounded by the failure thresholds of [`ControllerConfig`].

mod delete;
mod election;
pub mod metrics;
mod provision;

pub use election::ElectionOutcome;
pub use metrics::ControllerMetrics;
pub use provision::ProvisionOutcome;

use crate::config::ControllerConfig;
use crate::domain::objects::{
    claim_class, claim_key, claim_requested_provisioner, claim_requests_block, claim_volume_name,
    volume_class, volume_mode, volume_phase, volume_provisioned_by, volume_reclaim_policy,
};
use crate::domain::ports::{ClusterApiRef, EventRecorderRef, RegisteredProvisioner};
use crate::error::{Error, ErrorClass, Result};
use crate::informer::{cache_key, run_informer, ChangeKind, ObjectCache};
use crate::queue::{default_controller_rate_limiter, WorkQueue};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::{Api, Client, ResourceExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Event Reasons
// =============================================================================

pub const REASON_PROVISIONING: &str = "Provisioning";
pub const REASON_PROVISIONING_SUCCEEDED: &str = "ProvisioningSucceeded";
pub const REASON_PROVISIONING_FAILED: &str = "ProvisioningFailed";
pub const REASON_PROVISIONING_CLEANUP_FAILED: &str = "ProvisioningCleanupFailed";
pub const REASON_VOLUME_FAILED_DELETE: &str = "VolumeFailedDelete";

// =============================================================================
// Controller
// =============================================================================

/// Caches to share with the controller instead of letting it watch on its
/// own. Whoever supplies a cache keeps it fed and forwards its changes to
/// [`ProvisionController::handle_claim_change`] or
/// [`ProvisionController::handle_volume_change`].
#[derive(Default)]
pub struct SharedCaches {
    pub claims: Option<Arc<ObjectCache<PersistentVolumeClaim>>>,
    pub volumes: Option<Arc<ObjectCache<PersistentVolume>>>,
    pub classes: Option<Arc<ObjectCache<StorageClass>>>,
}

/// Which caches `run` feeds itself
#[derive(Debug, Clone, Copy)]
struct OwnedInformers {
    claims: bool,
    volumes: bool,
    classes: bool,
}

pub struct ProvisionController {
    config: ControllerConfig,
    /// Holder identity written into claim leases
    identity: String,
    provisioner: RegisteredProvisioner,
    api: ClusterApiRef,
    recorder: EventRecorderRef,

    claims: Arc<ObjectCache<PersistentVolumeClaim>>,
    volumes: Arc<ObjectCache<PersistentVolume>>,
    classes: Arc<ObjectCache<StorageClass>>,
    informers: OwnedInformers,

    claim_queue: WorkQueue,
    volume_queue: WorkQueue,

    /// Claim UID -> result channel of the election running for it
    elections: election::Elections,
    /// Volumes whose backing storage is gone but whose object is not
    pending_removals: Mutex<HashSet<String>>,

    metrics: Arc<ControllerMetrics>,
    stop: CancellationToken,
    ran: AtomicBool,
}

impl ProvisionController {
    pub fn new(
        config: ControllerConfig,
        provisioner: RegisteredProvisioner,
        api: ClusterApiRef,
        recorder: EventRecorderRef,
    ) -> Result<Arc<Self>> {
        Self::with_caches(config, provisioner, api, recorder, SharedCaches::default())
    }

    /// Like [`new`](Self::new), reading from `caches` where they are given
    pub fn with_caches(
        config: ControllerConfig,
        provisioner: RegisteredProvisioner,
        api: ClusterApiRef,
        recorder: EventRecorderRef,
        caches: SharedCaches,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let informers = OwnedInformers {
            claims: caches.claims.is_none(),
            volumes: caches.volumes.is_none(),
            classes: caches.classes.is_none(),
        };
        let backoff = config.exponential_backoff_on_error;
        Ok(Arc::new(Self {
            identity: uuid::Uuid::new_v4().to_string(),
            provisioner,
            api,
            recorder,
            claims: caches.claims.unwrap_or_else(ObjectCache::new),
            volumes: caches.volumes.unwrap_or_else(ObjectCache::new),
            classes: caches.classes.unwrap_or_else(ObjectCache::new),
            informers,
            claim_queue: WorkQueue::new("claims", default_controller_rate_limiter(backoff)),
            volume_queue: WorkQueue::new("volumes", default_controller_rate_limiter(backoff)),
            elections: Mutex::new(HashMap::new()),
            pending_removals: Mutex::new(HashSet::new()),
            metrics: Arc::new(ControllerMetrics::new()?),
            stop: CancellationToken::new(),
            ran: AtomicBool::new(false),
            config,
        }))
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<ControllerMetrics> {
        &self.metrics
    }

    pub fn claims(&self) -> &Arc<ObjectCache<PersistentVolumeClaim>> {
        &self.claims
    }

    pub fn volumes(&self) -> &Arc<ObjectCache<PersistentVolume>> {
        &self.volumes
    }

    pub fn classes(&self) -> &Arc<ObjectCache<StorageClass>> {
        &self.classes
    }

    pub fn claim_queue(&self) -> &WorkQueue {
        &self.claim_queue
    }

    pub fn volume_queue(&self) -> &WorkQueue {
        &self.volume_queue
    }

    /// Token that fires when the controller is shut down
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Whether the controller has been started
    pub fn has_run(&self) -> bool {
        self.ran.load(Ordering::SeqCst)
    }

    /// Whether every cache has completed its first listing
    pub fn has_synced(&self) -> bool {
        self.claims.has_synced() && self.volumes.has_synced() && self.classes.has_synced()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Run informers, workers and (if enabled) the metrics server until
    /// [`shutdown`](Self::shutdown) is called
    pub async fn run(self: &Arc<Self>, client: Client) -> Result<()> {
        self.ran.store(true, Ordering::SeqCst);
        info!(
            provisioner = %self.config.provisioner_name,
            identity = %self.identity,
            "Starting provision controller"
        );

        let resync = self.config.resync_period;
        let mut tasks = Vec::new();

        if self.informers.claims {
            let this = Arc::clone(self);
            tasks.push(tokio::spawn(run_informer(
                Api::<PersistentVolumeClaim>::all(client.clone()),
                self.claims.clone(),
                resync,
                move |claim: &PersistentVolumeClaim, kind| this.handle_claim_change(claim, kind),
                self.stop.clone(),
            )));
        }

        if self.informers.volumes {
            let this = Arc::clone(self);
            tasks.push(tokio::spawn(run_informer(
                Api::<PersistentVolume>::all(client.clone()),
                self.volumes.clone(),
                resync,
                move |volume: &PersistentVolume, kind| this.handle_volume_change(volume, kind),
                self.stop.clone(),
            )));
        }

        if self.informers.classes {
            tasks.push(tokio::spawn(run_informer(
                Api::<StorageClass>::all(client),
                self.classes.clone(),
                resync,
                |_: &StorageClass, _| {},
                self.stop.clone(),
            )));
        }
        debug!(informers = ?self.informers, "Informers started");

        if self.config.metrics.enabled() {
            let serving = metrics::serve(
                self.config.metrics.clone(),
                self.metrics.clone(),
                self.stop.clone(),
            );
            tasks.push(tokio::spawn(async move {
                if let Err(e) = serving.await {
                    error!("Metrics server error: {}", e);
                }
            }));
        }

        info!("Waiting for caches to sync");
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = async {
                self.claims.wait_synced().await;
                self.volumes.wait_synced().await;
                self.classes.wait_synced().await;
            } => {
                info!("Caches synced, starting workers");
                self.run_workers().await;
            }
        }

        self.shutdown();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Controller task failed: {}", e);
            }
        }
        info!("Provision controller stopped");
        Ok(())
    }

    /// Run `threadiness` workers per queue until the queues shut down
    pub async fn run_workers(self: &Arc<Self>) {
        self.ran.store(true, Ordering::SeqCst);
        let mut workers = Vec::with_capacity(self.config.threadiness * 2);
        for _ in 0..self.config.threadiness {
            workers.push(tokio::spawn(Arc::clone(self).run_claim_worker()));
            workers.push(tokio::spawn(Arc::clone(self).run_volume_worker()));
        }
        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                error!("Worker failed: {}", e);
            }
        }
    }

    /// Stop informers, workers, elections and the metrics server
    pub fn shutdown(&self) {
        if !self.stop.is_cancelled() {
            info!("Shutting down provision controller");
        }
        self.stop.cancel();
        self.claim_queue.shutdown();
        self.volume_queue.shutdown();
    }

    // =========================================================================
    // Event Handlers
    // =========================================================================

    pub fn handle_claim_change(&self, claim: &PersistentVolumeClaim, kind: ChangeKind) {
        enqueue(&self.claim_queue, &cache_key(claim), kind);
    }

    pub fn handle_volume_change(&self, volume: &PersistentVolume, kind: ChangeKind) {
        if kind == ChangeKind::Deleted {
            self.pending_removals.lock().remove(&volume.name_any());
        }
        enqueue(&self.volume_queue, &cache_key(volume), kind);
    }

    // =========================================================================
    // Workers
    // =========================================================================

    async fn run_claim_worker(self: Arc<Self>) {
        while let Some(key) = self.claim_queue.get().await {
            let result = self.sync_claim_handler(&key).await;
            finish(
                &self.claim_queue,
                &key,
                result,
                self.config.failed_provision_threshold,
                "claim",
            );
            self.claim_queue.done(&key);
        }
    }

    async fn run_volume_worker(self: Arc<Self>) {
        while let Some(key) = self.volume_queue.get().await {
            let result = self.sync_volume_handler(&key).await;
            finish(
                &self.volume_queue,
                &key,
                result,
                self.config.failed_delete_threshold,
                "volume",
            );
            self.volume_queue.done(&key);
        }
    }

    /// Reconcile the cached claim stored under `key`
    pub async fn sync_claim_handler(self: &Arc<Self>, key: &str) -> Result<()> {
        match self.claims.get_by_key(key) {
            Some(claim) => self.sync_claim(&claim).await,
            None => {
                debug!(claim = key, "Claim no longer exists");
                Ok(())
            }
        }
    }

    /// Provision a volume for `claim` if it should have one
    pub async fn sync_claim(self: &Arc<Self>, claim: &PersistentVolumeClaim) -> Result<()> {
        if !self.should_provision(claim) {
            return Ok(());
        }
        match self.lock_provision_claim_operation(claim).await {
            Ok(outcome) => {
                debug!(claim = %claim_key(claim), ?outcome, "Claim synced");
                Ok(())
            }
            Err(e) => Err(Error::Shared(e)),
        }
    }

    /// Reconcile the cached volume stored under `key`
    pub async fn sync_volume_handler(&self, key: &str) -> Result<()> {
        let volume = match self.volumes.get_by_key(key) {
            Some(volume) => volume,
            None => {
                debug!(volume = key, "Volume no longer exists");
                return Ok(());
            }
        };
        self.sync_volume(&volume).await
    }

    /// Delete `volume` if it should be deleted
    pub async fn sync_volume(&self, volume: &PersistentVolume) -> Result<()> {
        if !self.should_delete(volume) {
            return Ok(());
        }
        let started = Instant::now();
        let result = self.delete_volume_operation(volume).await;
        self.metrics.record_delete(
            &volume_class(volume),
            &volume_mode(volume),
            result.is_ok(),
            started.elapsed(),
        );
        result
    }

    // =========================================================================
    // Decisions
    // =========================================================================

    /// Whether `claim` is unbound and asks for this provisioner
    pub fn should_provision(&self, claim: &PersistentVolumeClaim) -> bool {
        if claim_volume_name(claim).is_some() {
            return false;
        }

        let name = &self.config.provisioner_name;
        let requested = match claim_requested_provisioner(claim) {
            Some(requested) => requested == name,
            None => {
                let class = claim_class(claim);
                !class.is_empty()
                    && self
                        .classes
                        .get_by_key(&class)
                        .is_some_and(|class| &class.provisioner == name)
            }
        };

        requested && self.provisioner.qualifies(claim)
    }

    /// Whether `volume` is ours and its reclaim policy asks for deletion
    pub fn should_delete(&self, volume: &PersistentVolume) -> bool {
        let reclaimable = match volume_phase(volume) {
            "Released" => true,
            "Failed" => self.config.reclaim_failed_volumes,
            _ => false,
        };

        reclaimable
            && volume_reclaim_policy(volume) == "Delete"
            && volume_provisioned_by(volume) == Some(self.config.provisioner_name.as_str())
    }

    /// Check the claim against the capabilities the provisioner declared
    pub fn can_provision(&self, claim: &PersistentVolumeClaim) -> Result<()> {
        if claim_requests_block(claim) && !self.provisioner.supports_block() {
            return Err(Error::CannotProvision {
                claim: claim_key(claim),
                reason: format!(
                    "{} does not support block volume provisioning",
                    self.config.provisioner_name
                ),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for ProvisionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionController")
            .field("provisioner", &self.config.provisioner_name)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

fn enqueue(queue: &WorkQueue, key: &str, kind: ChangeKind) {
    match kind {
        // A key with outstanding retries is already scheduled
        ChangeKind::Upserted if queue.num_requeues(key) == 0 => queue.add(key),
        ChangeKind::Upserted => {}
        // A waiting key stays queued; the worker finds it gone
        ChangeKind::Deleted => queue.forget(key),
    }
}

fn finish(queue: &WorkQueue, key: &str, result: Result<()>, threshold: u32, kind: &str) {
    let e = match result {
        Ok(()) => {
            queue.forget(key);
            return;
        }
        Err(e) => e,
    };

    match e.class() {
        ErrorClass::Transient | ErrorClass::Logical => {}
        ErrorClass::Orphaned => {
            error!(key, "Giving up syncing {}: {}", kind, e);
            queue.forget(key);
            return;
        }
        ErrorClass::Ignored | ErrorClass::Unsupported => {
            warn!(key, "Not retrying {}: {}", kind, e);
            queue.forget(key);
            return;
        }
    }

    let failures = queue.num_requeues(key);
    if threshold == 0 || failures < threshold {
        warn!(key, failures, "Retrying syncing {}: {}", kind, e);
        queue.add_rate_limited(key);
    } else {
        error!(
            key,
            failures,
            threshold,
            "Giving up syncing {} after too many failures: {}",
            kind,
            e
        );
    }
}
