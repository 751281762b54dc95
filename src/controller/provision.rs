//! Provisioning a volume for one claim

use super::{
    ProvisionController, REASON_PROVISIONING, REASON_PROVISIONING_CLEANUP_FAILED,
    REASON_PROVISIONING_FAILED, REASON_PROVISIONING_SUCCEEDED,
};
use crate::domain::objects::{
    claim_class, claim_key, provisioned_volume_name, ANN_DYNAMICALLY_PROVISIONED,
    ANN_SELECTED_NODE,
};
use crate::domain::ports::{EventType, VolumeOptions};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{Node, ObjectReference, PersistentVolume, PersistentVolumeClaim};
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, warn};

/// What a provision operation did, when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// A volume was created and saved
    Provisioned,
    /// The volume already existed; nothing was done
    AlreadyProvisioned,
    /// The claim belongs to someone else
    Skipped,
}

/// Reference to a claim for `claimRef` and events
fn claim_reference(claim: &PersistentVolumeClaim) -> Result<ObjectReference> {
    if claim.uid().unwrap_or_default().is_empty() || claim.meta().name.is_none() {
        return Err(Error::Internal(format!(
            "cannot reference claim {}: name and UID are required",
            claim_key(claim)
        )));
    }
    Ok(claim.object_ref(&()))
}

impl ProvisionController {
    /// Provision a volume for `claim`. Errors of class
    /// [`Transient`](crate::error::ErrorClass::Transient) ask for a retry.
    pub async fn provision_claim_operation(
        &self,
        claim: &PersistentVolumeClaim,
    ) -> Result<ProvisionOutcome> {
        let key = claim_key(claim);
        let class_name = claim_class(claim);
        let pv_name = provisioned_volume_name(claim);
        debug!(claim = %key, class = %class_name, "Provisioning claim");

        if self.api.get_volume(&pv_name).await?.is_some() {
            info!(claim = %key, volume = %pv_name, "Volume already exists, skipping");
            return Ok(ProvisionOutcome::AlreadyProvisioned);
        }

        let claim_ref = claim_reference(claim)?;

        let class = self
            .classes
            .get_by_key(&class_name)
            .ok_or_else(|| Error::StorageClassNotFound {
                name: class_name.clone(),
            })?;
        if class.provisioner != self.config.provisioner_name {
            info!(
                claim = %key,
                class = %class_name,
                provisioner = %class.provisioner,
                "StorageClass names another provisioner, skipping"
            );
            return Ok(ProvisionOutcome::Skipped);
        }

        if let Err(e) = self.can_provision(claim) {
            self.recorder
                .record(&claim_ref, EventType::Warning, REASON_PROVISIONING_FAILED, &e.to_string())
                .await;
            return Err(e);
        }

        let selected_node = match self.selected_node(claim).await {
            Ok(node) => node,
            Err(e) => {
                self.recorder
                    .record(&claim_ref, EventType::Warning, REASON_PROVISIONING_FAILED, &e.to_string())
                    .await;
                return Err(e);
            }
        };

        let options = VolumeOptions {
            reclaim_policy: class
                .reclaim_policy
                .clone()
                .unwrap_or_else(|| "Delete".to_string()),
            pv_name: pv_name.clone(),
            claim: claim.clone(),
            mount_options: class.mount_options.clone().unwrap_or_default(),
            parameters: class.parameters.clone().unwrap_or_default(),
            selected_node,
            allowed_topologies: class.allowed_topologies.clone().unwrap_or_default(),
        };

        self.recorder
            .record(
                &claim_ref,
                EventType::Normal,
                REASON_PROVISIONING,
                &format!("External provisioner is provisioning volume for claim {:?}", key),
            )
            .await;

        let mut volume = match self.provisioner.provisioner().provision(options).await {
            Ok(volume) => volume,
            Err(e) if e.is_ignored() => {
                info!(claim = %key, reason = %e, "Provisioner ignored claim");
                return Ok(ProvisionOutcome::Skipped);
            }
            Err(e) => {
                let message = format!(
                    "Failed to provision volume with StorageClass {:?}: {}",
                    class_name, e
                );
                warn!(claim = %key, "{}", message);
                self.recorder
                    .record(&claim_ref, EventType::Warning, REASON_PROVISIONING_FAILED, &message)
                    .await;
                return Err(e);
            }
        };
        info!(claim = %key, volume = %volume.name_any(), "Volume provisioned");

        let spec = volume.spec.get_or_insert_with(Default::default);
        spec.claim_ref = Some(claim_ref.clone());
        spec.storage_class_name = Some(class_name.clone());
        volume.annotations_mut().insert(
            ANN_DYNAMICALLY_PROVISIONED.to_string(),
            self.config.provisioner_name.clone(),
        );

        match self.save_volume(&key, &volume).await {
            Ok(()) => {
                self.recorder
                    .record(
                        &claim_ref,
                        EventType::Normal,
                        REASON_PROVISIONING_SUCCEEDED,
                        &format!("Successfully provisioned volume {}", volume.name_any()),
                    )
                    .await;
                Ok(ProvisionOutcome::Provisioned)
            }
            Err(e) => self.clean_up_unsaved(&key, &claim_ref, &volume, e).await,
        }
    }

    /// Node picked by the scheduler, if the claim names one
    async fn selected_node(&self, claim: &PersistentVolumeClaim) -> Result<Option<Node>> {
        let name = match claim.annotations().get(ANN_SELECTED_NODE) {
            Some(name) if !name.is_empty() => name,
            _ => return Ok(None),
        };
        match self.api.get_node(name).await? {
            Some(node) => Ok(Some(node)),
            None => Err(Error::ResourceNotFound {
                kind: "Node".into(),
                name: name.clone(),
            }),
        }
    }

    /// Create the volume object, retrying a bounded number of times. A
    /// volume that already exists under the name is taken as saved.
    async fn save_volume(&self, key: &str, volume: &PersistentVolume) -> Result<()> {
        let attempts = self.config.create_provisioned_pv_retry_count;
        let name = volume.name_any();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.api.create_volume(volume).await {
                Ok(_) => {
                    info!(claim = %key, volume = %name, "Volume saved");
                    return Ok(());
                }
                Err(e) if e.is_already_exists() => {
                    info!(claim = %key, volume = %name, "Volume already saved, reusing it");
                    return Ok(());
                }
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    warn!(claim = %key, volume = %name, attempt, "Failed to save volume: {}", e);
                    tokio::time::sleep(self.config.create_provisioned_pv_interval).await;
                }
            }
        }
    }

    /// The volume could not be saved: delete its storage so nothing leaks
    async fn clean_up_unsaved(
        &self,
        key: &str,
        claim_ref: &ObjectReference,
        volume: &PersistentVolume,
        cause: Error,
    ) -> Result<ProvisionOutcome> {
        let name = volume.name_any();
        let message = format!(
            "Error creating provisioned PV object for claim {}: {}. Deleting the volume.",
            key, cause
        );
        warn!(claim = %key, volume = %name, "{}", message);
        self.recorder
            .record(claim_ref, EventType::Warning, REASON_PROVISIONING_FAILED, &message)
            .await;

        let attempts = self.config.create_provisioned_pv_retry_count;
        let mut attempt = 0;
        let last_error = loop {
            attempt += 1;
            match self.provisioner.provisioner().delete(volume).await {
                Ok(()) => {
                    info!(claim = %key, volume = %name, "Cleaned up unsaved volume");
                    return Err(Error::VolumeSaveFailed {
                        volume: name,
                        claim: key.to_string(),
                        reason: cause.to_string(),
                    });
                }
                Err(e) if attempt >= attempts => break e,
                Err(e) => {
                    warn!(claim = %key, volume = %name, attempt, "Failed to clean up volume: {}", e);
                    tokio::time::sleep(self.config.create_provisioned_pv_interval).await;
                }
            }
        };

        let message = format!(
            "Error cleaning provisioned volume for claim {}: {}. Please delete manually.",
            key, last_error
        );
        error!(claim = %key, volume = %name, "{}", message);
        self.recorder
            .record(claim_ref, EventType::Warning, REASON_PROVISIONING_CLEANUP_FAILED, &message)
            .await;
        Err(Error::OrphanedVolume {
            volume: name,
            claim: key.to_string(),
            reason: last_error.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::domain::objects::volume_provisioned_by;
    use crate::error::ErrorClass;
    use crate::testing::{
        claim, controller, node, reasons_for, storage_class, volume, FakeProvisioner, PROVISIONER,
    };
    use assert_matches::assert_matches;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::time::Duration;

    fn config() -> ControllerConfig {
        let mut config = ControllerConfig::new(PROVISIONER);
        config.create_provisioned_pv_interval = Duration::from_millis(10);
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_saves_stamped_volume() {
        let provisioner = FakeProvisioner::new();
        let (ctrl, cluster) = controller(config(), provisioner.clone());
        ctrl.classes().upsert(storage_class("sc1", PROVISIONER));
        let pvc = claim("ns", "pvc1", "u1", "sc1");

        let outcome = ctrl.provision_claim_operation(&pvc).await.unwrap();
        assert_eq!(outcome, ProvisionOutcome::Provisioned);
        assert_eq!(provisioner.provision_calls(), 1);

        let pv = cluster.volume("pvc-u1").unwrap();
        let spec = pv.spec.as_ref().unwrap();
        assert_eq!(spec.storage_class_name.as_deref(), Some("sc1"));
        assert_eq!(spec.persistent_volume_reclaim_policy.as_deref(), Some("Delete"));
        assert_eq!(
            spec.capacity.as_ref().unwrap().get("storage"),
            Some(&Quantity("10Gi".into()))
        );
        let claim_ref = spec.claim_ref.as_ref().unwrap();
        assert_eq!(claim_ref.namespace.as_deref(), Some("ns"));
        assert_eq!(claim_ref.name.as_deref(), Some("pvc1"));
        assert_eq!(claim_ref.uid.as_deref(), Some("u1"));
        assert_eq!(volume_provisioned_by(&pv), Some(PROVISIONER));

        let reasons = reasons_for(&cluster.events(), "ns/pvc1");
        assert_eq!(reasons.get(REASON_PROVISIONING), Some(&1));
        assert_eq!(reasons.get(REASON_PROVISIONING_SUCCEEDED), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_volume_is_not_provisioned_again() {
        let provisioner = FakeProvisioner::new();
        let (ctrl, cluster) = controller(config(), provisioner.clone());
        ctrl.classes().upsert(storage_class("sc1", PROVISIONER));
        cluster.add_volume(volume("pvc-u1", "Bound", "Delete", Some(PROVISIONER)));

        let outcome = ctrl
            .provision_claim_operation(&claim("ns", "pvc1", "u1", "sc1"))
            .await
            .unwrap();
        assert_eq!(outcome, ProvisionOutcome::AlreadyProvisioned);
        assert_eq!(provisioner.provision_calls(), 0);
        assert!(cluster.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_class_is_retryable() {
        let provisioner = FakeProvisioner::new();
        let (ctrl, _cluster) = controller(config(), provisioner.clone());

        let err = ctrl
            .provision_claim_operation(&claim("ns", "pvc1", "u1", "sc1"))
            .await
            .unwrap_err();
        assert_matches!(err, Error::StorageClassNotFound { .. });
        assert!(err.is_retryable());
        assert_eq!(provisioner.provision_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_class_is_skipped_silently() {
        let provisioner = FakeProvisioner::new();
        let (ctrl, cluster) = controller(config(), provisioner.clone());
        ctrl.classes().upsert(storage_class("sc1", "example.com/other"));

        let outcome = ctrl
            .provision_claim_operation(&claim("ns", "pvc1", "u1", "sc1"))
            .await
            .unwrap();
        assert_eq!(outcome, ProvisionOutcome::Skipped);
        assert_eq!(provisioner.provision_calls(), 0);
        assert!(cluster.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_claim_without_block_support() {
        let provisioner = FakeProvisioner::new();
        let (ctrl, cluster) = controller(config(), provisioner.clone());
        ctrl.classes().upsert(storage_class("sc1", PROVISIONER));
        let mut pvc = claim("ns", "pvc1", "u1", "sc1");
        pvc.spec.as_mut().unwrap().volume_mode = Some("Block".into());

        let err = ctrl.provision_claim_operation(&pvc).await.unwrap_err();
        assert_matches!(err, Error::CannotProvision { .. });
        assert_eq!(err.class(), ErrorClass::Unsupported);
        assert_eq!(provisioner.provision_calls(), 0);
        assert_eq!(cluster.event_reasons(), vec![REASON_PROVISIONING_FAILED]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_selected_node_is_passed_on() {
        let provisioner = FakeProvisioner::new();
        let (ctrl, cluster) = controller(config(), provisioner.clone());
        ctrl.classes().upsert(storage_class("sc1", PROVISIONER));
        let mut pvc = claim("ns", "pvc1", "u1", "sc1");
        pvc.annotations_mut()
            .insert(ANN_SELECTED_NODE.to_string(), "node-a".to_string());

        // Unknown node: reported and retried
        let err = ctrl.provision_claim_operation(&pvc).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(cluster.event_reasons(), vec![REASON_PROVISIONING_FAILED]);

        cluster.add_node(node("node-a"));
        let outcome = ctrl.provision_claim_operation(&pvc).await.unwrap();
        assert_eq!(outcome, ProvisionOutcome::Provisioned);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_by_provisioner() {
        let provisioner = FakeProvisioner::new();
        provisioner.ignore_all(true);
        let (ctrl, cluster) = controller(config(), provisioner.clone());
        ctrl.classes().upsert(storage_class("sc1", PROVISIONER));

        let outcome = ctrl
            .provision_claim_operation(&claim("ns", "pvc1", "u1", "sc1"))
            .await
            .unwrap();
        assert_eq!(outcome, ProvisionOutcome::Skipped);
        assert_eq!(cluster.event_reasons(), vec![REASON_PROVISIONING]);
        assert_eq!(cluster.volume_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_failure_is_reported_and_retryable() {
        let provisioner = FakeProvisioner::new();
        provisioner.fail_provision(true);
        let (ctrl, cluster) = controller(config(), provisioner.clone());
        ctrl.classes().upsert(storage_class("sc1", PROVISIONER));

        let err = ctrl
            .provision_claim_operation(&claim("ns", "pvc1", "u1", "sc1"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            cluster.event_reasons(),
            vec![REASON_PROVISIONING, REASON_PROVISIONING_FAILED]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_retries_then_succeeds() {
        let provisioner = FakeProvisioner::new();
        let (ctrl, cluster) = controller(config(), provisioner.clone());
        ctrl.classes().upsert(storage_class("sc1", PROVISIONER));
        cluster.fail_create_volume(4);

        let outcome = ctrl
            .provision_claim_operation(&claim("ns", "pvc1", "u1", "sc1"))
            .await
            .unwrap();
        assert_eq!(outcome, ProvisionOutcome::Provisioned);
        assert_eq!(cluster.create_volume_calls(), 5);
        assert_eq!(provisioner.delete_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_failure_cleans_up_and_retries() {
        let provisioner = FakeProvisioner::new();
        let (ctrl, cluster) = controller(config(), provisioner.clone());
        ctrl.classes().upsert(storage_class("sc1", PROVISIONER));
        cluster.fail_create_volume(5);

        let err = ctrl
            .provision_claim_operation(&claim("ns", "pvc1", "u1", "sc1"))
            .await
            .unwrap_err();
        assert_matches!(err, Error::VolumeSaveFailed { .. });
        assert!(err.is_retryable());
        assert_eq!(cluster.create_volume_calls(), 5);
        assert_eq!(provisioner.delete_calls(), 1);

        let reasons = reasons_for(&cluster.events(), "ns/pvc1");
        assert_eq!(reasons.get(REASON_PROVISIONING_FAILED), Some(&1));
        assert_eq!(reasons.get(REASON_PROVISIONING_CLEANUP_FAILED), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_failure_orphans_volume() {
        let provisioner = FakeProvisioner::new();
        provisioner.fail_delete(true);
        let (ctrl, cluster) = controller(config(), provisioner.clone());
        ctrl.classes().upsert(storage_class("sc1", PROVISIONER));
        cluster.fail_create_volume(5);

        let err = ctrl
            .provision_claim_operation(&claim("ns", "pvc1", "u1", "sc1"))
            .await
            .unwrap_err();
        assert_matches!(err, Error::OrphanedVolume { .. });
        assert_eq!(err.class(), ErrorClass::Orphaned);
        assert!(!err.is_retryable());
        assert_eq!(provisioner.delete_calls(), 5);

        let events = cluster.events();
        let cleanup = events
            .iter()
            .find(|e| e.reason == REASON_PROVISIONING_CLEANUP_FAILED)
            .unwrap();
        assert_eq!(cleanup.event_type, EventType::Warning);
        assert!(cleanup.message.contains("Please delete manually"));
        assert_eq!(
            events
                .iter()
                .filter(|e| e.reason == REASON_PROVISIONING_FAILED)
                .count(),
            1
        );
    }
}
