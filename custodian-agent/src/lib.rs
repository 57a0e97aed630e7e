//! Host-side building blocks for the Custodian agent daemon.
//!
//! The engine in `custodian-sync` is platform agnostic. This crate supplies
//! the pieces a plain host needs: a state collector that reports basic
//! system facts and an executor that publishes enforcement decisions to a
//! status file for the platform's lock screen service to pick up.

pub mod executor;
pub mod host;

pub use executor::{EnforcementStatus, StatusFileExecutor};
pub use host::{HostCollector, HostReport};
