//! Per-object Leader Election
//!
//! Short-lived leases that let several controller replicas agree on which
//! one acts on a given object. The lease record lives on the object itself.

pub mod elector;
pub mod lock;
pub mod record;

pub use elector::{LeaderElector, LeadershipEnd};
pub use lock::{ClaimLock, ResourceLock};
pub use record::LeaderElectionRecord;
