//! Helpers over the Kubernetes objects the controller reconciles

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::ResourceExt;

// =============================================================================
// Annotations
// =============================================================================

/// Storage class of a claim, legacy form; wins over `spec.storageClassName`
pub const ANN_CLASS: &str = "volume.beta.kubernetes.io/storage-class";

/// Set on volumes by the provisioner that created them
pub const ANN_DYNAMICALLY_PROVISIONED: &str = "pv.kubernetes.io/provisioned-by";

/// Set on claims by the binder, naming the provisioner expected to serve them
pub const ANN_STORAGE_PROVISIONER: &str = "volume.kubernetes.io/storage-provisioner";
pub const ANN_BETA_STORAGE_PROVISIONER: &str = "volume.beta.kubernetes.io/storage-provisioner";

/// Node chosen by the scheduler for delayed-binding claims
pub const ANN_SELECTED_NODE: &str = "volume.kubernetes.io/selected-node";

/// Leader election record of the per-claim lock
pub const ANN_LEADER_ELECTION_RECORD: &str = "control-plane.alpha.kubernetes.io/leader";

// =============================================================================
// Claims
// =============================================================================

/// `namespace/name` key of a claim
pub fn claim_key(claim: &PersistentVolumeClaim) -> String {
    object_key(claim.namespace().as_deref(), &claim.name_any())
}

/// `namespace/name`, or just `name` for cluster-scoped objects
pub fn object_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

/// Split a queue key back into namespace and name
pub fn split_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once('/') {
        Some((ns, name)) => (Some(ns), name),
        None => (None, key),
    }
}

/// StorageClass requested by a claim; empty if none
pub fn claim_class(claim: &PersistentVolumeClaim) -> String {
    if let Some(class) = claim.annotations().get(ANN_CLASS) {
        return class.clone();
    }
    claim
        .spec
        .as_ref()
        .and_then(|spec| spec.storage_class_name.clone())
        .unwrap_or_default()
}

/// Provisioner named on the claim by the binder, if any
pub fn claim_requested_provisioner(claim: &PersistentVolumeClaim) -> Option<&str> {
    let annotations = claim.annotations();
    annotations
        .get(ANN_STORAGE_PROVISIONER)
        .or_else(|| annotations.get(ANN_BETA_STORAGE_PROVISIONER))
        .map(String::as_str)
}

/// Volume the claim is bound to, if any
pub fn claim_volume_name(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .spec
        .as_ref()
        .and_then(|spec| spec.volume_name.as_deref())
        .filter(|name| !name.is_empty())
}

pub fn claim_requests_block(claim: &PersistentVolumeClaim) -> bool {
    claim
        .spec
        .as_ref()
        .and_then(|spec| spec.volume_mode.as_deref())
        == Some("Block")
}

pub fn claim_uid(claim: &PersistentVolumeClaim) -> String {
    claim.uid().unwrap_or_default()
}

/// Deterministic name of the volume provisioned for a claim
pub fn provisioned_volume_name(claim: &PersistentVolumeClaim) -> String {
    format!("pvc-{}", claim_uid(claim))
}

// =============================================================================
// Volumes
// =============================================================================

pub fn volume_phase(volume: &PersistentVolume) -> &str {
    volume
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .unwrap_or("")
}

pub fn volume_reclaim_policy(volume: &PersistentVolume) -> &str {
    volume
        .spec
        .as_ref()
        .and_then(|spec| spec.persistent_volume_reclaim_policy.as_deref())
        .unwrap_or("")
}

pub fn volume_class(volume: &PersistentVolume) -> String {
    if let Some(class) = volume.annotations().get(ANN_CLASS) {
        return class.clone();
    }
    volume
        .spec
        .as_ref()
        .and_then(|spec| spec.storage_class_name.clone())
        .unwrap_or_default()
}

/// `Filesystem` unless the volume says otherwise
pub fn volume_mode(volume: &PersistentVolume) -> String {
    volume
        .spec
        .as_ref()
        .and_then(|spec| spec.volume_mode.clone())
        .unwrap_or_else(|| "Filesystem".to_string())
}

pub fn volume_provisioned_by(volume: &PersistentVolume) -> Option<&str> {
    volume
        .annotations()
        .get(ANN_DYNAMICALLY_PROVISIONED)
        .map(String::as_str)
}
