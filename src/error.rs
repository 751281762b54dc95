//! Error types for the provisioning controller
//!
//! Every failure the reconciler can observe is one variant of [`Error`].
//! [`Error::class`] sorts them into the handling categories the work queues
//! and event reporting act on.

use thiserror::Error;

/// Unified error type for the controller
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Conflicting update of {kind}/{name}")]
    Conflict { kind: String, name: String },

    #[error("Watch failed: {0}")]
    Watch(String),

    /// Outcome of an operation that several callers waited on
    #[error(transparent)]
    Shared(std::sync::Arc<Error>),

    // =========================================================================
    // Provisioning Errors
    // =========================================================================
    #[error("StorageClass {name:?} not found")]
    StorageClassNotFound { name: String },

    #[error("Cannot provision claim {claim}: {reason}")]
    CannotProvision { claim: String, reason: String },

    #[error("Invalid parameter {key:?}: {reason}")]
    InvalidParameter { key: String, reason: String },

    /// Another provisioner is expected to handle the object
    #[error("Ignored: {0}")]
    Ignored(String),

    #[error("Provisioner failed: {0}")]
    Provisioner(#[from] anyhow::Error),

    #[error("Failed to save volume {volume} for claim {claim}, backing storage was removed: {reason}")]
    VolumeSaveFailed {
        volume: String,
        claim: String,
        reason: String,
    },

    #[error("Volume {volume} for claim {claim} is orphaned: {reason}")]
    OrphanedVolume {
        volume: String,
        claim: String,
        reason: String,
    },

    // =========================================================================
    // Leader Election Errors
    // =========================================================================
    #[error("Leader election error for {lock}: {reason}")]
    LeaderElection { lock: String, reason: String },

    // =========================================================================
    // Metrics Errors
    // =========================================================================
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the reconciler treats an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Someone else handles the object; not a failure
    Ignored,
    /// Requeue with backoff up to the failure threshold
    Transient,
    /// Reported, not retried by the operation itself; the queue still
    /// requeues it up to the failure threshold
    Logical,
    /// The provisioner declared it cannot serve the object
    Unsupported,
    /// A storage asset leaked; needs an operator
    Orphaned,
}

impl Error {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Ignored(_) => ErrorClass::Ignored,

            Error::Shared(inner) => inner.class(),

            Error::OrphanedVolume { .. } => ErrorClass::Orphaned,

            Error::CannotProvision { .. } => ErrorClass::Unsupported,

            Error::Configuration(_)
            | Error::InvalidParameter { .. }
            | Error::JsonParse(_) => ErrorClass::Logical,

            _ => ErrorClass::Transient,
        }
    }

    /// Check if this is the cooperative-skip signal
    pub fn is_ignored(&self) -> bool {
        self.class() == ErrorClass::Ignored
    }

    /// Check if this error is worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }

    /// Check for an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 409 && resp.reason == "Conflict",
            _ => false,
        }
    }

    /// Check for a create that lost to an existing object
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::ResourceExists { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => {
                resp.code == 409 && resp.reason == "AlreadyExists"
            }
            _ => false,
        }
    }

    /// Check for a missing object
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }
}

/// Result type alias for the controller
pub type Result<T> = std::result::Result<T, Error>;
