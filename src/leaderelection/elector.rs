//! Lease-based leader elector
//!
//! Contends for a [`ResourceLock`] and keeps renewing it while leading. A
//! lease held by someone else is respected until `lease_duration` has passed
//! since this elector last saw the record change, so clocks of different
//! replicas never have to agree.

use super::lock::ResourceLock;
use super::record::LeaderElectionRecord;
use crate::config::LeaderElectionConfig;
use crate::error::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a leader stopped renewing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipEnd {
    /// The caller asked renewal to stop
    Stopped,
    /// No renewal succeeded within the renew deadline
    Lost,
    /// The term limit was reached
    TermExpired,
}

struct Observed {
    record: LeaderElectionRecord,
    at: Instant,
}

pub struct LeaderElector {
    lock: Arc<dyn ResourceLock>,
    config: LeaderElectionConfig,
    observed: Mutex<Option<Observed>>,
    leading: AtomicBool,
}

impl LeaderElector {
    pub fn new(lock: Arc<dyn ResourceLock>, config: LeaderElectionConfig) -> Self {
        Self {
            lock,
            config,
            observed: Mutex::new(None),
            leading: AtomicBool::new(false),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leading.load(Ordering::SeqCst)
    }

    pub fn identity(&self) -> &str {
        self.lock.identity()
    }

    /// One attempt at taking or renewing the lease. `Ok(false)` means
    /// someone else holds it or won a concurrent write.
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let identity = self.lock.identity().to_string();
        let current = self.lock.get().await?;
        let now = Utc::now();

        let mut next = LeaderElectionRecord {
            holder_identity: identity.clone(),
            lease_duration_seconds: self.config.lease_duration.as_secs(),
            acquire_time: now,
            renew_time: now,
            leader_transitions: 0,
        };

        if let Some(current) = current {
            let held_by_other = current.is_held() && current.holder_identity != identity;
            let observed_at = self.observe(&current);
            if held_by_other && observed_at + self.config.lease_duration > Instant::now() {
                debug!(
                    lock = %self.lock.describe(),
                    holder = %current.holder_identity,
                    "Lock is held by another candidate"
                );
                return Ok(false);
            }

            if current.holder_identity == identity {
                next.acquire_time = current.acquire_time;
                next.leader_transitions = current.leader_transitions;
            } else {
                next.leader_transitions = current.leader_transitions + 1;
            }
        }

        match self.lock.update(&next).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                debug!(lock = %self.lock.describe(), "Lost a concurrent lock update");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        *self.observed.lock() = Some(Observed {
            record: next,
            at: Instant::now(),
        });
        if !self.leading.swap(true, Ordering::SeqCst) {
            info!(lock = %self.lock.describe(), identity = %identity, "Became leader");
        }
        Ok(true)
    }

    /// Remember when `record` was first seen; returns that instant
    fn observe(&self, record: &LeaderElectionRecord) -> Instant {
        let mut observed = self.observed.lock();
        match observed.as_ref() {
            Some(seen) if seen.record == *record => seen.at,
            _ => {
                let at = Instant::now();
                *observed = Some(Observed {
                    record: record.clone(),
                    at,
                });
                at
            }
        }
    }

    /// Contend every retry period until the lease is held. Returns `false`
    /// if `stop` fired first.
    pub async fn acquire(&self, stop: &CancellationToken) -> bool {
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => {
                    debug!(lock = %self.lock.describe(), error = %e, "Failed to acquire lock")
                }
            }
            tokio::select! {
                _ = stop.cancelled() => return false,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Renew the lease every retry period until `stop` fires, a renewal
    /// cannot succeed within the renew deadline, or the term limit is hit.
    pub async fn renew(&self, stop: &CancellationToken) -> LeadershipEnd {
        let started = Instant::now();
        let end = loop {
            tokio::select! {
                _ = stop.cancelled() => break LeadershipEnd::Stopped,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }

            let term_limit = self.config.term_limit;
            if !term_limit.is_zero() && started.elapsed() >= term_limit {
                info!(lock = %self.lock.describe(), "Leader term limit reached");
                break LeadershipEnd::TermExpired;
            }

            if !self.renew_within_deadline(stop).await {
                if stop.is_cancelled() {
                    break LeadershipEnd::Stopped;
                }
                warn!(lock = %self.lock.describe(), "Failed to renew lease, leadership lost");
                break LeadershipEnd::Lost;
            }
        };
        if end != LeadershipEnd::Stopped {
            self.leading.store(false, Ordering::SeqCst);
        }
        end
    }

    async fn renew_within_deadline(&self, stop: &CancellationToken) -> bool {
        let deadline = Instant::now() + self.config.renew_deadline;
        loop {
            match tokio::time::timeout_at(deadline, self.try_acquire_or_renew()).await {
                Ok(Ok(true)) => return true,
                Ok(Ok(false)) => {}
                Ok(Err(e)) => {
                    debug!(lock = %self.lock.describe(), error = %e, "Lease renewal failed")
                }
                Err(_) => return false,
            }
            tokio::select! {
                _ = stop.cancelled() => return false,
                _ = tokio::time::sleep_until(deadline) => return false,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Give the lease up if the stored record still names us. Also clears
    /// a record left behind after renewal ended on its own.
    pub async fn release(&self) {
        self.leading.store(false, Ordering::SeqCst);
        match self.lock.release().await {
            Ok(()) => debug!(lock = %self.lock.describe(), "Released lock"),
            Err(e) => warn!(lock = %self.lock.describe(), error = %e, "Failed to release lock"),
        }
    }
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("lock", &self.lock.describe())
            .field("leading", &self.is_leader())
            .finish()
    }
}
