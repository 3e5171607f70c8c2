//! Replica-set control-plane contracts.
//!
//! The replication data plane (row streaming, vclocks, consensus) lives
//! elsewhere; this crate provides the contracts it consumes from the
//! core: process-wide instance identity, the applier state machine with
//! its state-change triggers, and the replica registry with the
//! quorum-wait rendezvous — all built on fibers, triggers and condition
//! variables of `twine-core`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod applier;
pub mod error;
pub mod instance;
pub mod replicaset;

pub use applier::{Applier, ApplierState};
pub use error::{ClusterError, Result};
pub use replicaset::{Replica, Replicaset};
