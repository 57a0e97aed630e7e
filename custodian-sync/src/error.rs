//! Error types for the sync engine.

use custodian_storage::StorageError;
use custodian_types::{LockMode, Timestamp};
use std::fmt;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Why a device identity was rejected or could not be produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    /// Empty or whitespace-only candidate.
    #[error("identity is blank")]
    Blank,

    /// A known sentinel value that does not identify a real device.
    #[error("identity is a placeholder value: {0}")]
    Placeholder(String),

    /// Shorter than the configured minimum.
    #[error("identity too short: {len} < {min} characters")]
    TooShort { len: usize, min: usize },

    /// No usable identity is registered.
    #[error("identity invalid: {0}")]
    Invalid(String),

    /// The primary identity store could not be written or read.
    #[error("identity storage error: {0}")]
    Storage(String),
}

impl From<StorageError> for IdentityError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e.to_string())
    }
}

/// A remote directive discarded because a newer local tamper lock is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectiveConflict {
    pub requested_mode: LockMode,
    pub directive_timestamp: Option<Timestamp>,
    pub tamper_detected_at: Timestamp,
}

impl fmt::Display for DirectiveConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.directive_timestamp {
            Some(ts) => write!(
                f,
                "{} directive issued at {} predates tamper detection at {}",
                self.requested_mode, ts, self.tamper_detected_at
            ),
            None => write!(
                f,
                "undated {} directive cannot override tamper lock from {}",
                self.requested_mode, self.tamper_detected_at
            ),
        }
    }
}

/// Why a lock transition was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// The directive is older than the active tamper lock.
    #[error("stale directive: {0}")]
    Stale(DirectiveConflict),

    /// The device has been deactivated; only re-registration leaves this state.
    #[error("lock state is terminal (device deactivated)")]
    Terminal,

    /// A tamper lock can only be lifted by the remote authority.
    #[error("device is tamper locked")]
    TamperLocked,

    /// The offline unlock token does not match the last one issued.
    #[error("invalid unlock token")]
    InvalidUnlockToken,

    /// Local administrative events may raise enforcement, never lower it.
    #[error("local unlock requires an unlock token")]
    UnlockRequiresToken,

    /// The lock record could not be persisted.
    #[error("lock storage error: {0}")]
    Storage(String),
}

impl From<StorageError> for TransitionError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network error.
    #[error("network error: {0}")]
    Network(String),

    /// The authority answered with something we cannot interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The authority rejected our credentials.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,

    /// Identity missing or invalid.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Lock transition refused.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Neither the lock record nor its shadow copy could be read.
    #[error("lock state corrupt: {0}")]
    CorruptLockState(String),

    /// The platform enforcement layer reported a failure.
    #[error("enforcement failed: {0}")]
    Enforcement(String),
}

impl From<StorageError> for SyncError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<custodian_types::Error> for SyncError {
    fn from(e: custodian_types::Error) -> Self {
        match e {
            custodian_types::Error::Serialization(e) => Self::Serialization(e),
            other => Self::Protocol(other.to_string()),
        }
    }
}
