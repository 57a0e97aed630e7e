//! Core type definitions for the Custodian device agent.
//!
//! This crate defines the plain data model shared by the engine crates:
//! - Record identifiers (UUID v7)
//! - Millisecond wall-clock timestamps and the injectable `Clock`
//! - Lock state, directives from the remote authority and tamper events
//! - Opaque device state snapshots
//!
//! Nothing here performs I/O. Persistence lives in `custodian-storage`,
//! behaviour in `custodian-sync`.

mod directive;
mod ids;
mod lock;
mod snapshot;
mod tamper;
mod timestamp;

pub use directive::Directive;
pub use ids::RecordId;
pub use lock::{Authority, LockMode, LockState, ReasonCategory};
pub use snapshot::StateSnapshot;
pub use tamper::{ReportStatus, Severity, TamperEvent};
pub use timestamp::{Clock, ManualClock, SystemClock, Timestamp};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}
