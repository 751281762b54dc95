//! In-memory fakes and object builders for unit tests

use crate::config::ControllerConfig;
use crate::controller::ProvisionController;
use crate::domain::objects::{claim_key, object_key, ANN_LEADER_ELECTION_RECORD};
use crate::domain::ports::{
    ClaimWatchEvent, ClusterApi, EventRecorder, EventType, Provisioner, RegisteredProvisioner,
    VolumeOptions,
};
use crate::error::{Error, Result};
use crate::leaderelection::LeaderElectionRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::api::core::v1::{
    HostPathVolumeSource, Node, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeSpec, PersistentVolumeStatus,
    VolumeResourceRequirements,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};

/// Provisioner name the test controllers answer to
pub const PROVISIONER: &str = "example.com/fake";

// =============================================================================
// Builders
// =============================================================================

/// Unbound 10Gi ReadWriteOnce claim of `class`
pub fn claim(namespace: &str, name: &str, uid: &str, class: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            uid: Some(uid.into()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            storage_class_name: Some(class.into()),
            access_modes: Some(vec!["ReadWriteOnce".into()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity("10Gi".into()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn bound(mut claim: PersistentVolumeClaim, volume_name: &str) -> PersistentVolumeClaim {
    if let Some(spec) = claim.spec.as_mut() {
        spec.volume_name = Some(volume_name.into());
    }
    claim
}

pub fn volume(
    name: &str,
    phase: &str,
    reclaim_policy: &str,
    provisioned_by: Option<&str>,
) -> PersistentVolume {
    let mut pv = PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.into()),
            uid: Some(format!("uid-{}", name)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            persistent_volume_reclaim_policy: Some(reclaim_policy.into()),
            storage_class_name: Some("sc1".into()),
            host_path: Some(HostPathVolumeSource {
                path: format!("/tmp/{}", name),
                type_: None,
            }),
            ..Default::default()
        }),
        status: Some(PersistentVolumeStatus {
            phase: Some(phase.into()),
            ..Default::default()
        }),
    };
    if let Some(provisioner) = provisioned_by {
        pv.annotations_mut().insert(
            crate::domain::objects::ANN_DYNAMICALLY_PROVISIONED.to_string(),
            provisioner.to_string(),
        );
    }
    pv
}

pub fn storage_class(name: &str, provisioner: &str) -> StorageClass {
    StorageClass {
        metadata: ObjectMeta {
            name: Some(name.into()),
            ..Default::default()
        },
        provisioner: provisioner.into(),
        ..Default::default()
    }
}

pub fn node(name: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.into()),
            ..Default::default()
        },
        ..Default::default()
    }
}

// =============================================================================
// Fake Cluster
// =============================================================================

/// An event recorded through the fake recorder
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub object: String,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Clone)]
enum Signal {
    ClaimChanged(PersistentVolumeClaim),
    ClaimDeleted { key: String },
    Event { uid: String, reason: String },
}

#[derive(Default)]
struct ClusterState {
    claims: BTreeMap<String, PersistentVolumeClaim>,
    volumes: BTreeMap<String, PersistentVolume>,
    nodes: BTreeMap<String, Node>,
    resource_version: u64,
    events: Vec<RecordedEvent>,
    create_volume_failures: u32,
    delete_volume_failures: u32,
    create_volume_calls: usize,
}

/// API server stand-in shared by every controller of a test. Also records
/// events, which are fanned out to claim watchers like real events are.
pub struct FakeCluster {
    state: Mutex<ClusterState>,
    signals: broadcast::Sender<Signal>,
    watchers: Arc<AtomicUsize>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        let (signals, _) = broadcast::channel(1024);
        Arc::new(Self {
            state: Mutex::new(ClusterState::default()),
            signals,
            watchers: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn next_version(state: &mut ClusterState) -> String {
        state.resource_version += 1;
        state.resource_version.to_string()
    }

    /// Create or overwrite a claim, ignoring resource versions
    pub fn add_claim(&self, mut claim: PersistentVolumeClaim) {
        let key = claim_key(&claim);
        {
            let mut state = self.state.lock();
            claim.metadata.resource_version = Some(Self::next_version(&mut state));
            state.claims.insert(key, claim.clone());
        }
        let _ = self.signals.send(Signal::ClaimChanged(claim));
    }

    pub fn delete_claim(&self, namespace: &str, name: &str) {
        let key = object_key(Some(namespace), name);
        self.state.lock().claims.remove(&key);
        let _ = self.signals.send(Signal::ClaimDeleted { key });
    }

    pub fn claim(&self, namespace: &str, name: &str) -> Option<PersistentVolumeClaim> {
        self.state
            .lock()
            .claims
            .get(&object_key(Some(namespace), name))
            .cloned()
    }

    pub fn leader_record(&self, namespace: &str, name: &str) -> Option<LeaderElectionRecord> {
        let claim = self.claim(namespace, name)?;
        let value = claim.annotations().get(ANN_LEADER_ELECTION_RECORD)?.clone();
        LeaderElectionRecord::from_annotation(&value).ok().flatten()
    }

    pub fn add_volume(&self, volume: PersistentVolume) {
        self.state.lock().volumes.insert(volume.name_any(), volume);
    }

    pub fn volume(&self, name: &str) -> Option<PersistentVolume> {
        self.state.lock().volumes.get(name).cloned()
    }

    pub fn volume_count(&self) -> usize {
        self.state.lock().volumes.len()
    }

    pub fn add_node(&self, node: Node) {
        self.state.lock().nodes.insert(node.name_any(), node);
    }

    /// Fail the next `times` volume creations
    pub fn fail_create_volume(&self, times: u32) {
        self.state.lock().create_volume_failures = times;
    }

    /// Fail the next `times` volume deletions
    pub fn fail_delete_volume(&self, times: u32) {
        self.state.lock().delete_volume_failures = times;
    }

    pub fn create_volume_calls(&self) -> usize {
        self.state.lock().create_volume_calls
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.state.lock().events.clone()
    }

    pub fn event_reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }

    /// Claim watches currently open
    pub fn active_watchers(&self) -> usize {
        self.watchers.load(Ordering::SeqCst)
    }

    /// Poll until `n` claim watches are open
    pub async fn wait_for_watchers(&self, n: usize) {
        while self.active_watchers() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

struct WatchGuard(Arc<AtomicUsize>);

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.volume(name))
    }

    async fn create_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume> {
        let mut state = self.state.lock();
        state.create_volume_calls += 1;
        if state.create_volume_failures > 0 {
            state.create_volume_failures -= 1;
            return Err(Error::Internal("injected create failure".into()));
        }
        let name = volume.name_any();
        if state.volumes.contains_key(&name) {
            return Err(Error::ResourceExists {
                kind: "PersistentVolume".into(),
                name,
            });
        }
        let mut created = volume.clone();
        created.metadata.resource_version = Some(Self::next_version(&mut state));
        state.volumes.insert(name, created.clone());
        Ok(created)
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.delete_volume_failures > 0 {
            state.delete_volume_failures -= 1;
            return Err(Error::Internal("injected delete failure".into()));
        }
        match state.volumes.remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::ResourceNotFound {
                kind: "PersistentVolume".into(),
                name: name.into(),
            }),
        }
    }

    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.claim(namespace, name))
    }

    async fn replace_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let key = claim_key(claim);
        let updated = {
            let mut state = self.state.lock();
            let current = state
                .claims
                .get(&key)
                .ok_or_else(|| Error::ResourceNotFound {
                    kind: "PersistentVolumeClaim".into(),
                    name: key.clone(),
                })?;
            if current.metadata.resource_version != claim.metadata.resource_version {
                return Err(Error::Conflict {
                    kind: "PersistentVolumeClaim".into(),
                    name: key,
                });
            }
            let mut updated = claim.clone();
            updated.metadata.resource_version = Some(Self::next_version(&mut state));
            state.claims.insert(key, updated.clone());
            updated
        };
        let _ = self.signals.send(Signal::ClaimChanged(updated.clone()));
        Ok(updated)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.state.lock().nodes.get(name).cloned())
    }

    // Subscribing is immediate, so nothing recorded after `since` is missed
    async fn watch_claim(
        &self,
        claim: &PersistentVolumeClaim,
        _since: DateTime<Utc>,
    ) -> Result<BoxStream<'static, ClaimWatchEvent>> {
        let key = claim_key(claim);
        let uid = claim.uid().unwrap_or_default();
        let receiver = self.signals.subscribe();
        self.watchers.fetch_add(1, Ordering::SeqCst);
        let guard = WatchGuard(self.watchers.clone());

        let events = stream::unfold((receiver, guard), move |(mut receiver, guard)| {
            let key = key.clone();
            let uid = uid.clone();
            async move {
                loop {
                    let event = match receiver.recv().await {
                        Ok(Signal::ClaimChanged(claim)) if claim_key(&claim) == key => {
                            ClaimWatchEvent::Changed(claim)
                        }
                        Ok(Signal::ClaimDeleted { key: deleted }) if deleted == key => {
                            ClaimWatchEvent::Deleted
                        }
                        Ok(Signal::Event { uid: regarding, reason }) if regarding == uid => {
                            ClaimWatchEvent::Event { reason }
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    };
                    return Some((event, (receiver, guard)));
                }
            }
        });
        Ok(events.boxed())
    }
}

#[async_trait]
impl EventRecorder for FakeCluster {
    async fn record(
        &self,
        regarding: &ObjectReference,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) {
        self.state.lock().events.push(RecordedEvent {
            object: object_key(
                regarding.namespace.as_deref(),
                regarding.name.as_deref().unwrap_or_default(),
            ),
            event_type,
            reason: reason.into(),
            message: message.into(),
        });
        let _ = self.signals.send(Signal::Event {
            uid: regarding.uid.clone().unwrap_or_default(),
            reason: reason.into(),
        });
    }
}

// =============================================================================
// Fake Provisioner
// =============================================================================

/// Provisioner that builds a hostPath volume in memory and counts calls
#[derive(Default)]
pub struct FakeProvisioner {
    provision_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    fail_provision: AtomicBool,
    fail_delete: AtomicBool,
    ignore: AtomicBool,
    reject_parameters: AtomicBool,
    panic_on_provision: AtomicBool,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeProvisioner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn provision_calls(&self) -> usize {
        self.provision_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn fail_provision(&self, fail: bool) {
        self.fail_provision.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    /// Answer every call with `Error::Ignored`
    pub fn ignore_all(&self, ignore: bool) {
        self.ignore.store(ignore, Ordering::SeqCst);
    }

    /// Answer `provision` with `Error::InvalidParameter`
    pub fn reject_parameters(&self, reject: bool) {
        self.reject_parameters.store(reject, Ordering::SeqCst);
    }

    /// Panic inside `provision`
    pub fn panic_on_provision(&self, panic: bool) {
        self.panic_on_provision.store(panic, Ordering::SeqCst);
    }

    /// Make `provision` wait until the returned semaphore gets a permit
    pub fn hold(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    /// Poll until `provision` has been entered `n` times
    pub async fn wait_for_provision_calls(&self, n: usize) {
        while self.provision_calls() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn provision(&self, options: VolumeOptions) -> Result<PersistentVolume> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if self.panic_on_provision.load(Ordering::SeqCst) {
            panic!("provisioner crashed");
        }
        if self.ignore.load(Ordering::SeqCst) {
            return Err(Error::Ignored("not this backend's claim".into()));
        }
        if self.reject_parameters.load(Ordering::SeqCst) {
            return Err(Error::InvalidParameter {
                key: "replicas".into(),
                reason: "unsupported".into(),
            });
        }
        if self.fail_provision.load(Ordering::SeqCst) {
            return Err(Error::Provisioner(anyhow::anyhow!("backend unavailable")));
        }

        let capacity = options
            .claim
            .spec
            .as_ref()
            .and_then(|spec| spec.resources.as_ref())
            .and_then(|resources| resources.requests.clone())
            .unwrap_or_default();
        Ok(PersistentVolume {
            metadata: ObjectMeta {
                name: Some(options.pv_name.clone()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                persistent_volume_reclaim_policy: Some(options.reclaim_policy),
                access_modes: options
                    .claim
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.access_modes.clone()),
                capacity: Some(capacity),
                mount_options: Some(options.mount_options),
                host_path: Some(HostPathVolumeSource {
                    path: format!("/fake/{}", options.pv_name),
                    type_: None,
                }),
                ..Default::default()
            }),
            status: None,
        })
    }

    async fn delete(&self, volume: &PersistentVolume) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.ignore.load(Ordering::SeqCst) {
            return Err(Error::Ignored(format!("{} was not created here", volume.name_any())));
        }
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(Error::Provisioner(anyhow::anyhow!("backend unavailable")));
        }
        Ok(())
    }
}

/// Events recorded against `object`, by reason
pub fn reasons_for(events: &[RecordedEvent], object: &str) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for event in events.iter().filter(|e| e.object == object) {
        *counts.entry(event.reason.clone()).or_insert(0) += 1;
    }
    counts
}

// =============================================================================
// Controllers
// =============================================================================

/// Controller over a fresh fake cluster
pub fn controller(
    config: ControllerConfig,
    provisioner: Arc<FakeProvisioner>,
) -> (Arc<ProvisionController>, Arc<FakeCluster>) {
    let cluster = FakeCluster::new();
    let ctrl = replica(config, RegisteredProvisioner::new(provisioner), &cluster);
    (ctrl, cluster)
}

/// Another controller on an existing fake cluster
pub fn replica(
    config: ControllerConfig,
    provisioner: RegisteredProvisioner,
    cluster: &Arc<FakeCluster>,
) -> Arc<ProvisionController> {
    ProvisionController::new(config, provisioner, cluster.clone(), cluster.clone())
        .expect("valid test config")
}
