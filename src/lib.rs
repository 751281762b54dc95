//! External Provisioner - dynamic volume provisioning for Kubernetes
//!
//! A controller that watches PersistentVolumeClaims and PersistentVolumes
//! and delegates the storage work to a pluggable [`Provisioner`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        Provision Controller                          │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐   ┌───────────────┐   ┌────────────────────────────┐ │
//! │  │ Informers  │──▶│  Work Queues  │──▶│  Claim / Volume Workers    │ │
//! │  │ (PVC/PV/SC)│   │ (rate limited)│   │                            │ │
//! │  └────────────┘   └───────────────┘   └─────────────┬──────────────┘ │
//! │                                                     │                │
//! │                       ┌─────────────────────────────┴──────────┐     │
//! │                       │   Per-claim Leader Election (lease in  │     │
//! │                       │   a claim annotation)                  │     │
//! │                       └─────────────────────────────┬──────────┘     │
//! ├─────────────────────────────────────────────────────┴────────────────┤
//! │                 Provisioner (storage-system specific)                │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: the reconciler, its state machines and metrics
//! - [`leaderelection`]: per-claim leases
//! - [`queue`]: rate-limited work queues
//! - [`informer`]: watch-fed object caches
//! - [`kubernetes`]: adapters to a live cluster
//! - [`provisioners`]: bundled provisioner implementations
//! - [`domain`]: ports and object helpers
//! - [`error`]: error types and handling

pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod informer;
pub mod kubernetes;
pub mod leaderelection;
pub mod provisioners;
pub mod queue;

#[cfg(test)]
pub mod testing;

// Re-export commonly used types
pub use config::{ControllerConfig, LeaderElectionConfig, MetricsConfig};

pub use controller::{
    ControllerMetrics, ElectionOutcome, ProvisionController, ProvisionOutcome, SharedCaches,
};

pub use domain::ports::{
    ClaimWatchEvent, ClusterApi, EventRecorder, EventType, Provisioner, Qualifier,
    RegisteredProvisioner, VolumeOptions,
};

pub use error::{Error, ErrorClass, Result};

pub use kubernetes::{KubeClusterApi, KubeEventRecorder};

pub use provisioners::HostPathProvisioner;

pub use queue::WorkQueue;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
