//! Provisioner implementations shipped with the controller

pub mod hostpath;

pub use hostpath::HostPathProvisioner;
