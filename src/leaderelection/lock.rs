//! Resource locks
//!
//! A lock is any object that can hold a [`LeaderElectionRecord`] and reject
//! stale writes. Claims are locked through an annotation on the claim itself.

use super::record::LeaderElectionRecord;
use crate::domain::objects::ANN_LEADER_ELECTION_RECORD;
use crate::domain::ports::ClusterApiRef;
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use parking_lot::Mutex;

/// Storage for a leader election record
#[async_trait]
pub trait ResourceLock: Send + Sync {
    /// Current record, `None` if there is none
    async fn get(&self) -> Result<Option<LeaderElectionRecord>>;

    /// Write `record` over the version last returned by [`get`](Self::get)
    async fn update(&self, record: &LeaderElectionRecord) -> Result<()>;

    /// Clear the record if `identity` still holds it
    async fn release(&self) -> Result<()>;

    /// Identity written into the records of this lock
    fn identity(&self) -> &str;

    /// Human readable name of the lock for logs
    fn describe(&self) -> String;
}

// =============================================================================
// Claim Lock
// =============================================================================

/// Lock stored in the leader annotation of a claim
pub struct ClaimLock {
    api: ClusterApiRef,
    namespace: String,
    name: String,
    identity: String,
    /// Claim as last read, carrying the resourceVersion updates are based on
    observed: Mutex<Option<PersistentVolumeClaim>>,
}

impl ClaimLock {
    pub fn new(api: ClusterApiRef, claim: &PersistentVolumeClaim, identity: impl Into<String>) -> Self {
        Self {
            api,
            namespace: claim.namespace().unwrap_or_default(),
            name: claim.name_any(),
            identity: identity.into(),
            observed: Mutex::new(None),
        }
    }

    async fn fetch(&self) -> Result<PersistentVolumeClaim> {
        self.api
            .get_claim(&self.namespace, &self.name)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "PersistentVolumeClaim".into(),
                name: self.describe(),
            })
    }

    async fn write(&self, mut claim: PersistentVolumeClaim, value: String) -> Result<()> {
        claim
            .annotations_mut()
            .insert(ANN_LEADER_ELECTION_RECORD.to_string(), value);
        let updated = self.api.replace_claim(&claim).await?;
        *self.observed.lock() = Some(updated);
        Ok(())
    }
}

fn record_of(claim: &PersistentVolumeClaim) -> Result<Option<LeaderElectionRecord>> {
    match claim.annotations().get(ANN_LEADER_ELECTION_RECORD) {
        Some(value) => Ok(LeaderElectionRecord::from_annotation(value)?),
        None => Ok(None),
    }
}

#[async_trait]
impl ResourceLock for ClaimLock {
    async fn get(&self) -> Result<Option<LeaderElectionRecord>> {
        let claim = self.fetch().await?;
        let record = record_of(&claim)?;
        *self.observed.lock() = Some(claim);
        Ok(record)
    }

    async fn update(&self, record: &LeaderElectionRecord) -> Result<()> {
        let claim = self
            .observed
            .lock()
            .clone()
            .ok_or_else(|| Error::LeaderElection {
                lock: self.describe(),
                reason: "record must be read before it is updated".into(),
            })?;
        self.write(claim, record.to_annotation()?).await
    }

    async fn release(&self) -> Result<()> {
        let claim = match self.api.get_claim(&self.namespace, &self.name).await? {
            Some(claim) => claim,
            // Deleted along with its record
            None => return Ok(()),
        };
        let held_by_us = record_of(&claim)
            .ok()
            .flatten()
            .is_some_and(|record| record.holder_identity == self.identity);
        if !held_by_us {
            return Ok(());
        }
        self.write(claim, String::new()).await
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl std::fmt::Debug for ClaimLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimLock")
            .field("claim", &self.describe())
            .field("identity", &self.identity)
            .finish()
    }
}
