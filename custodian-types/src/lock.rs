//! The canonical enforcement state of the device.

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The enforcement level currently asserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockMode {
    Unlocked,
    SoftLocked,
    HardLocked,
}

impl LockMode {
    /// Whether this mode restricts the device at all.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        !matches!(self, Self::Unlocked)
    }

    /// Returns the wire name of the mode.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unlocked => "UNLOCKED",
            Self::SoftLocked => "SOFT_LOCKED",
            Self::HardLocked => "HARD_LOCKED",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNLOCKED" => Ok(Self::Unlocked),
            "SOFT_LOCKED" => Ok(Self::SoftLocked),
            "HARD_LOCKED" => Ok(Self::HardLocked),
            other => Err(crate::Error::UnknownVariant {
                kind: "lock mode",
                value: other.to_string(),
            }),
        }
    }
}

/// Why the current mode is asserted. Orthogonal to [`LockMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCategory {
    Overdue,
    Tamper,
    Deactivation,
    Admin,
    None,
}

impl ReasonCategory {
    /// Returns the wire name of the reason.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Overdue => "OVERDUE",
            Self::Tamper => "TAMPER",
            Self::Deactivation => "DEACTIVATION",
            Self::Admin => "ADMIN",
            Self::None => "NONE",
        }
    }
}

impl fmt::Display for ReasonCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReasonCategory {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OVERDUE" => Ok(Self::Overdue),
            "TAMPER" => Ok(Self::Tamper),
            "DEACTIVATION" => Ok(Self::Deactivation),
            "ADMIN" => Ok(Self::Admin),
            "NONE" => Ok(Self::None),
            other => Err(crate::Error::UnknownVariant {
                kind: "reason category",
                value: other.to_string(),
            }),
        }
    }
}

/// Who asserted the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Authority {
    Local,
    Remote,
}

/// The single canonical lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    pub mode: LockMode,
    pub reason_category: ReasonCategory,
    pub reason_text: String,
    pub applied_at: Timestamp,
    pub source_authority: Authority,
    /// Timestamp of the remote directive that produced this state, if any.
    pub directive_timestamp: Option<Timestamp>,
    /// Detection time of the tamper event behind a local tamper lock.
    #[serde(default)]
    pub tamper_detected_at: Option<Timestamp>,
}

impl LockState {
    /// The state a device starts in on first boot.
    #[must_use]
    pub fn initial(now: Timestamp) -> Self {
        Self {
            mode: LockMode::Unlocked,
            reason_category: ReasonCategory::None,
            reason_text: String::new(),
            applied_at: now,
            source_authority: Authority::Local,
            directive_timestamp: None,
            tamper_detected_at: None,
        }
    }

    /// Whether the device has been released from management.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.reason_category == ReasonCategory::Deactivation
    }

    /// Whether a locally detected tamper event is holding a hard lock.
    #[must_use]
    pub fn is_tamper_locked(&self) -> bool {
        self.mode == LockMode::HardLocked
            && self.reason_category == ReasonCategory::Tamper
            && self.source_authority == Authority::Local
    }

    /// Whether mode and reason match another state, ignoring bookkeeping.
    #[must_use]
    pub fn same_assertion(&self, mode: LockMode, reason: ReasonCategory) -> bool {
        self.mode == mode && self.reason_category == reason
    }
}
