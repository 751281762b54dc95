//! Adapters binding the controller ports to a live cluster

mod cluster_api;
mod recorder;

pub use cluster_api::KubeClusterApi;
pub use recorder::KubeEventRecorder;
