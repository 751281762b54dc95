//! Domain Ports - Core trait definitions for the provisioning controller
//!
//! These traits define the boundaries between the reconciler and the outside
//! world: the storage backend ([`Provisioner`]), the Kubernetes API
//! ([`ClusterApi`]) and event reporting ([`EventRecorder`]).

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{
    Node, ObjectReference, PersistentVolume, PersistentVolumeClaim, TopologySelectorTerm,
};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Provisioning Request
// =============================================================================

/// Everything a provisioner is told about the volume it should create
#[derive(Debug, Clone)]
pub struct VolumeOptions {
    /// Reclaim policy the created volume must carry
    pub reclaim_policy: String,
    /// Name the volume must be created with
    pub pv_name: String,
    /// The claim being provisioned for
    pub claim: PersistentVolumeClaim,
    /// Mount options of the StorageClass
    pub mount_options: Vec<String>,
    /// StorageClass parameters
    pub parameters: BTreeMap<String, String>,
    /// Node picked by the scheduler, for topology-aware provisioning
    pub selected_node: Option<Node>,
    /// Topologies the StorageClass restricts volumes to
    pub allowed_topologies: Vec<TopologySelectorTerm>,
}

// =============================================================================
// Provisioner Port
// =============================================================================

/// Storage-system specific volume creation and deletion.
///
/// Returning [`Error::Ignored`](crate::error::Error::Ignored) from either
/// method tells the controller another provisioner is expected to handle the
/// object; it is not counted as a failure.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create a storage asset and describe it as a PersistentVolume
    async fn provision(&self, options: VolumeOptions) -> Result<PersistentVolume>;

    /// Delete the storage asset behind a volume. Must succeed (or be a
    /// no-op) when the asset is already gone.
    async fn delete(&self, volume: &PersistentVolume) -> Result<()>;
}

/// Extra eligibility gate on top of the provisioner-name match
pub trait Qualifier: Send + Sync {
    fn should_provision(&self, claim: &PersistentVolumeClaim) -> bool;
}

/// A provisioner together with the optional capabilities it declared when it
/// was registered with the controller.
#[derive(Clone)]
pub struct RegisteredProvisioner {
    provisioner: Arc<dyn Provisioner>,
    qualifier: Option<Arc<dyn Qualifier>>,
    supports_block: bool,
}

impl RegisteredProvisioner {
    /// Register a provisioner with no optional capabilities
    pub fn new(provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            provisioner,
            qualifier: None,
            supports_block: false,
        }
    }

    /// Declare that raw block volumes can be provisioned
    pub fn with_block_support(mut self) -> Self {
        self.supports_block = true;
        self
    }

    /// Add an eligibility gate
    pub fn with_qualifier(mut self, qualifier: Arc<dyn Qualifier>) -> Self {
        self.qualifier = Some(qualifier);
        self
    }

    pub fn provisioner(&self) -> &Arc<dyn Provisioner> {
        &self.provisioner
    }

    pub fn supports_block(&self) -> bool {
        self.supports_block
    }

    /// Consult the qualifier, if any
    pub fn qualifies(&self, claim: &PersistentVolumeClaim) -> bool {
        self.qualifier
            .as_ref()
            .map_or(true, |qualifier| qualifier.should_provision(claim))
    }
}

impl std::fmt::Debug for RegisteredProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredProvisioner")
            .field("qualifier", &self.qualifier.is_some())
            .field("supports_block", &self.supports_block)
            .finish()
    }
}

// =============================================================================
// Cluster API Port
// =============================================================================

/// Something observed about a claim while its election is running
#[derive(Debug, Clone)]
pub enum ClaimWatchEvent {
    /// The claim was added or modified
    Changed(PersistentVolumeClaim),
    /// The claim was deleted
    Deleted,
    /// An event was recorded against the claim, by any replica
    Event { reason: String },
    /// The underlying watch broke
    Failed(String),
}

/// Reads and writes the controller performs directly against the API server,
/// bypassing the caches.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>>;

    /// Create a volume. Must fail with an error for which
    /// [`Error::is_already_exists`](crate::error::Error::is_already_exists)
    /// holds when the name is taken.
    async fn create_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume>;

    async fn delete_volume(&self, name: &str) -> Result<()>;

    async fn get_claim(&self, namespace: &str, name: &str)
        -> Result<Option<PersistentVolumeClaim>>;

    /// Replace a claim, honouring its `resourceVersion`. A stale version must
    /// fail with an error for which
    /// [`Error::is_conflict`](crate::error::Error::is_conflict) holds.
    async fn replace_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim>;

    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// Subscribe to changes of one claim and to the events recorded against
    /// it. The subscription is established when this returns, and events
    /// recorded from `since` on are delivered even if they predate it.
    /// Dropping the stream cancels the subscription.
    async fn watch_claim(
        &self,
        claim: &PersistentVolumeClaim,
        since: DateTime<Utc>,
    ) -> Result<BoxStream<'static, ClaimWatchEvent>>;
}

// =============================================================================
// Event Recorder Port
// =============================================================================

/// Severity of a recorded event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Normal => write!(f, "Normal"),
            EventType::Warning => write!(f, "Warning"),
        }
    }
}

/// Attaches events to the claims and volumes the controller works on.
/// Recording is best effort and never fails the caller.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(
        &self,
        regarding: &ObjectReference,
        event_type: EventType,
        reason: &str,
        message: &str,
    );
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ProvisionerRef = Arc<dyn Provisioner>;
pub type ClusterApiRef = Arc<dyn ClusterApi>;
pub type EventRecorderRef = Arc<dyn EventRecorder>;
