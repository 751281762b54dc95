//! Per-claim leader election around the provision operation
//!
//! Every replica that wants to provision a claim contends for the lease in
//! the claim's leader annotation. Only the holder provisions; the others
//! watch the claim and its events and step back once the outcome is known.
//! Within one process there is at most one election per claim: later
//! callers wait on the running one.

use super::provision::ProvisionOutcome;
use super::{ProvisionController, REASON_PROVISIONING_FAILED, REASON_PROVISIONING_SUCCEEDED};
use crate::domain::objects::{claim_class, claim_key, claim_uid, claim_volume_name};
use crate::domain::ports::ClaimWatchEvent;
use crate::error::Error;
use crate::leaderelection::{ClaimLock, LeaderElector, LeadershipEnd};
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How an election ended for this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// We held the lease and ran the provision operation
    Led(ProvisionOutcome),
    /// The claim was settled without us
    Followed,
    /// The controller shut down first
    Stopped,
}

pub(crate) type ElectionResult = std::result::Result<ElectionOutcome, Arc<Error>>;

pub(crate) type Elections = Mutex<HashMap<String, watch::Receiver<Option<ElectionResult>>>>;

/// Takes a claim's election out of the running set when dropped, so a
/// crashed election does not block later callers
struct ElectionEntry<'a> {
    elections: &'a Elections,
    uid: String,
}

impl Drop for ElectionEntry<'_> {
    fn drop(&mut self) {
        self.elections.lock().remove(&self.uid);
    }
}

impl ProvisionController {
    /// Provision `claim` under its lease, or wait for whoever holds it
    pub async fn lock_provision_claim_operation(
        self: &Arc<Self>,
        claim: &PersistentVolumeClaim,
    ) -> ElectionResult {
        let uid = claim_uid(claim);
        let key = claim_key(claim);

        let (mut results, publisher) = {
            let mut elections = self.elections.lock();
            match elections.get(&uid) {
                Some(results) => (results.clone(), None),
                None => {
                    let (publisher, results) = watch::channel(None);
                    elections.insert(uid.clone(), results.clone());
                    (results, Some(publisher))
                }
            }
        };

        match publisher {
            Some(publisher) => {
                let this = Arc::clone(self);
                let claim = claim.clone();
                tokio::spawn(async move {
                    let entry = ElectionEntry {
                        elections: &this.elections,
                        uid,
                    };
                    let result = this.run_election(&claim).await;
                    drop(entry);
                    let _ = publisher.send(Some(result));
                });
            }
            None => debug!(claim = %key, "Joining running election"),
        }

        let result = match results.wait_for(Option::is_some).await {
            Ok(done) => done.clone(),
            Err(_) => None,
        };
        result.unwrap_or_else(|| {
            Err(Arc::new(Error::LeaderElection {
                lock: key,
                reason: "election ended without a result".into(),
            }))
        })
    }

    async fn run_election(&self, claim: &PersistentVolumeClaim) -> ElectionResult {
        let key = claim_key(claim);
        let lock = ClaimLock::new(self.api.clone(), claim, self.identity.clone());
        let elector = LeaderElector::new(Arc::new(lock), self.config.leader_election.clone());
        let retry_period = self.config.leader_election.retry_period;

        let contest_start = Utc::now();
        let mut signals = self
            .api
            .watch_claim(claim, contest_start)
            .await
            .map_err(Arc::new)?;

        loop {
            match elector.try_acquire_or_renew().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => debug!(claim = %key, error = %e, "Failed to acquire claim lock"),
            }

            let next_attempt = Instant::now() + retry_period;
            loop {
                tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => return Ok(ElectionOutcome::Stopped),
                    signal = signals.next() => {
                        if self.ends_contest(&key, signal) {
                            return Ok(ElectionOutcome::Followed);
                        }
                    }
                    _ = tokio::time::sleep_until(next_attempt) => break,
                }
            }
        }
        drop(signals);

        info!(claim = %key, identity = %self.identity, "Leading provisioning of claim");
        let renewing = CancellationToken::new();
        let started = Instant::now();
        let (result, end) = tokio::join!(
            async {
                let result = self.provision_claim_operation(claim).await;
                renewing.cancel();
                result
            },
            elector.renew(&renewing),
        );

        let class = claim_class(claim);
        match &result {
            Ok(ProvisionOutcome::Provisioned) => {
                self.metrics
                    .record_provision(&class, true, started.elapsed())
            }
            Ok(_) => {}
            Err(_) => self.metrics.record_provision(&class, false, started.elapsed()),
        }
        if end != LeadershipEnd::Stopped {
            warn!(claim = %key, ?end, "Leadership ended before provisioning finished");
        }

        elector.release().await;
        result.map(ElectionOutcome::Led).map_err(Arc::new)
    }

    /// Whether a watch signal settles the claim for a non-leader
    fn ends_contest(&self, key: &str, signal: Option<ClaimWatchEvent>) -> bool {
        match signal {
            Some(ClaimWatchEvent::Changed(claim)) => {
                if claim_volume_name(&claim).is_some() {
                    debug!(claim = %key, "Claim was bound");
                    true
                } else if !self.should_provision(&claim) {
                    info!(claim = %key, "Claim no longer asks for this provisioner");
                    true
                } else {
                    false
                }
            }
            Some(ClaimWatchEvent::Deleted) => {
                info!(claim = %key, "Claim was deleted");
                true
            }
            Some(ClaimWatchEvent::Event { reason }) => {
                let settled =
                    reason == REASON_PROVISIONING_SUCCEEDED || reason == REASON_PROVISIONING_FAILED;
                if settled {
                    debug!(claim = %key, %reason, "Provisioning settled by another candidate");
                }
                settled
            }
            Some(ClaimWatchEvent::Failed(e)) => {
                info!(claim = %key, error = %e, "Claim watch failed");
                true
            }
            None => {
                info!(claim = %key, "Claim watch ended");
                true
            }
        }
    }
}
