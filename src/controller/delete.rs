//! Deleting a released volume

use super::{ProvisionController, REASON_VOLUME_FAILED_DELETE};
use crate::domain::ports::EventType;
use crate::error::Result;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

impl ProvisionController {
    /// Delete the storage behind `volume`, then the volume object.
    ///
    /// The volume is re-read first so a stale cache entry cannot trigger a
    /// deletion. Once the storage is gone, later passes only retry removing
    /// the object.
    pub async fn delete_volume_operation(&self, volume: &PersistentVolume) -> Result<()> {
        let name = volume.name_any();
        debug!(volume = %name, "Deleting volume");

        let volume = match self.api.get_volume(&name).await? {
            Some(volume) => volume,
            None => {
                info!(volume = %name, "Volume is already gone");
                self.pending_removals.lock().remove(&name);
                return Ok(());
            }
        };
        if !self.should_delete(&volume) {
            info!(volume = %name, "Volume no longer needs deleting");
            return Ok(());
        }

        let storage_deleted = self.pending_removals.lock().contains(&name);
        if !storage_deleted {
            match self.provisioner.provisioner().delete(&volume).await {
                Ok(()) => {
                    info!(volume = %name, "Volume storage deleted");
                    self.pending_removals.lock().insert(name.clone());
                }
                Err(e) if e.is_ignored() => {
                    info!(volume = %name, reason = %e, "Provisioner ignored volume");
                    return Ok(());
                }
                Err(e) => {
                    warn!(volume = %name, "Failed to delete volume storage: {}", e);
                    self.recorder
                        .record(
                            &volume.object_ref(&()),
                            EventType::Warning,
                            REASON_VOLUME_FAILED_DELETE,
                            &e.to_string(),
                        )
                        .await;
                    return Err(e);
                }
            }
        }

        match self.api.delete_volume(&name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(volume = %name, "Failed to delete volume object: {}", e);
                return Err(e);
            }
        }
        self.pending_removals.lock().remove(&name);
        info!(volume = %name, "Volume deleted");
        Ok(())
    }
}
