//! Leader election record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of a lease, serialized into the lock annotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderElectionRecord {
    pub holder_identity: String,
    pub lease_duration_seconds: u64,
    pub acquire_time: DateTime<Utc>,
    pub renew_time: DateTime<Utc>,
    #[serde(default)]
    pub leader_transitions: u32,
}

impl LeaderElectionRecord {
    /// An empty holder means the lock was released
    pub fn is_held(&self) -> bool {
        !self.holder_identity.is_empty()
    }

    /// Parse an annotation value; an empty value means no record
    pub fn from_annotation(value: &str) -> serde_json::Result<Option<Self>> {
        if value.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(value).map(Some)
    }

    pub fn to_annotation(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
