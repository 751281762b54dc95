//! Host Path Provisioner
//!
//! Backs each volume with a directory under a base path on the node the
//! controller runs on. Useful for single-node clusters and for exercising
//! the controller end to end.

use crate::domain::ports::{Provisioner, VolumeOptions};
use crate::error::{Error, Result};
use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    HostPathVolumeSource, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PersistentVolume, PersistentVolumeSpec, VolumeNodeAffinity,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Annotation naming the instance that created a volume
pub const ANN_PROVISIONER_IDENTITY: &str = "hostPathProvisionerIdentity";

/// StorageClass parameter: octal permissions of the created directory
pub const PARAM_DIRECTORY_MODE: &str = "directoryMode";

const DEFAULT_DIRECTORY_MODE: u32 = 0o777;
const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Provisions `hostPath` volumes under `base_dir`
#[derive(Debug, Clone)]
pub struct HostPathProvisioner {
    base_dir: PathBuf,
    identity: String,
}

impl HostPathProvisioner {
    pub fn new(base_dir: impl Into<PathBuf>, identity: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            identity: identity.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn volume_path(&self, pv_name: &str) -> PathBuf {
        self.base_dir.join(pv_name)
    }
}

fn directory_mode(parameters: &BTreeMap<String, String>) -> Result<u32> {
    let mut mode = DEFAULT_DIRECTORY_MODE;
    for (key, value) in parameters {
        match key.as_str() {
            PARAM_DIRECTORY_MODE => {
                mode = u32::from_str_radix(value, 8)
                    .ok()
                    .filter(|mode| *mode <= 0o7777)
                    .ok_or_else(|| Error::InvalidParameter {
                        key: key.clone(),
                        reason: format!("{:?} is not an octal file mode", value),
                    })?;
            }
            _ => {
                return Err(Error::InvalidParameter {
                    key: key.clone(),
                    reason: "unsupported by the hostPath provisioner".into(),
                })
            }
        }
    }
    Ok(mode)
}

/// Pin the volume to the node the scheduler picked
fn node_affinity(options: &VolumeOptions) -> Option<VolumeNodeAffinity> {
    let node = options.selected_node.as_ref()?;
    let hostname = node
        .labels()
        .get(HOSTNAME_LABEL)
        .cloned()
        .unwrap_or_else(|| node.name_any());
    Some(VolumeNodeAffinity {
        required: Some(NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(vec![NodeSelectorRequirement {
                    key: HOSTNAME_LABEL.to_string(),
                    operator: "In".to_string(),
                    values: Some(vec![hostname]),
                }]),
                match_fields: None,
            }],
        }),
    })
}

#[async_trait]
impl Provisioner for HostPathProvisioner {
    async fn provision(&self, options: VolumeOptions) -> Result<PersistentVolume> {
        let mode = directory_mode(&options.parameters)?;
        let path = self.volume_path(&options.pv_name);
        debug!(volume = %options.pv_name, path = %path.display(), "Creating directory");

        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("creating {}", path.display()))?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .await
            .with_context(|| format!("setting permissions of {}", path.display()))?;

        let claim_spec = options.claim.spec.clone().unwrap_or_default();
        let capacity = claim_spec
            .resources
            .and_then(|resources| resources.requests)
            .unwrap_or_default();

        let mut annotations = BTreeMap::new();
        annotations.insert(ANN_PROVISIONER_IDENTITY.to_string(), self.identity.clone());

        info!(volume = %options.pv_name, path = %path.display(), "Provisioned hostPath volume");
        Ok(PersistentVolume {
            metadata: ObjectMeta {
                name: Some(options.pv_name.clone()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                persistent_volume_reclaim_policy: Some(options.reclaim_policy.clone()),
                access_modes: claim_spec.access_modes,
                volume_mode: claim_spec.volume_mode,
                capacity: Some(capacity),
                mount_options: (!options.mount_options.is_empty())
                    .then(|| options.mount_options.clone()),
                node_affinity: node_affinity(&options),
                host_path: Some(HostPathVolumeSource {
                    path: path.to_string_lossy().into_owned(),
                    type_: Some("DirectoryOrCreate".to_string()),
                }),
                ..Default::default()
            }),
            status: None,
        })
    }

    async fn delete(&self, volume: &PersistentVolume) -> Result<()> {
        let name = volume.name_any();
        match volume.annotations().get(ANN_PROVISIONER_IDENTITY) {
            Some(identity) if identity == &self.identity => {}
            Some(identity) => {
                return Err(Error::Ignored(format!(
                    "{} was provisioned by {}, not {}",
                    name, identity, self.identity
                )))
            }
            None => {
                return Err(Error::Ignored(format!("{} carries no provisioner identity", name)))
            }
        }

        let path = self.volume_path(&name);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                info!(volume = %name, path = %path.display(), "Removed hostPath directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(volume = %name, "Directory already gone");
                Ok(())
            }
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("removing {}", path.display()))
                .into()),
        }
    }
}
