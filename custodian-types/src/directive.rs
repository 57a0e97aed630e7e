//! Instructions returned by the remote authority.

use crate::{LockMode, ReasonCategory, Timestamp};
use serde::{Deserialize, Serialize};

/// The authority's answer to a delivered report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    pub lock_mode: LockMode,
    pub reason_category: ReasonCategory,
    #[serde(default)]
    pub reason_text: String,
    /// When the authority issued the directive. Absent on legacy responses.
    #[serde(default)]
    pub directive_timestamp: Option<Timestamp>,
    /// Requested delay before the next heartbeat.
    #[serde(default)]
    pub next_contact_seconds: Option<u64>,
    /// Forces deactivation regardless of local precedence rules.
    #[serde(default)]
    pub deactivation_override: bool,
    /// Secret that allows an offline unlock of a payment lock.
    #[serde(default)]
    pub unlock_token: Option<String>,
}

impl Directive {
    /// A directive asserting `mode` for `reason`.
    pub fn new(lock_mode: LockMode, reason_category: ReasonCategory) -> Self {
        Self {
            lock_mode,
            reason_category,
            reason_text: String::new(),
            directive_timestamp: None,
            next_contact_seconds: None,
            deactivation_override: false,
            unlock_token: None,
        }
    }

    /// An UNLOCKED / NONE directive.
    pub fn unlock() -> Self {
        Self::new(LockMode::Unlocked, ReasonCategory::None)
    }

    /// The deactivation command. Always wins over local precedence.
    pub fn deactivate() -> Self {
        Self {
            deactivation_override: true,
            ..Self::new(LockMode::Unlocked, ReasonCategory::Deactivation)
        }
    }

    #[must_use]
    pub fn issued_at(mut self, ts: Timestamp) -> Self {
        self.directive_timestamp = Some(ts);
        self
    }

    #[must_use]
    pub fn with_reason_text(mut self, text: impl Into<String>) -> Self {
        self.reason_text = text.into();
        self
    }

    #[must_use]
    pub fn with_override(mut self) -> Self {
        self.deactivation_override = true;
        self
    }

    #[must_use]
    pub fn with_next_contact(mut self, seconds: u64) -> Self {
        self.next_contact_seconds = Some(seconds);
        self
    }

    #[must_use]
    pub fn with_unlock_token(mut self, token: impl Into<String>) -> Self {
        self.unlock_token = Some(token.into());
        self
    }

    /// Whether this directive releases the device from management.
    #[must_use]
    pub fn is_deactivation(&self) -> bool {
        self.deactivation_override || self.reason_category == ReasonCategory::Deactivation
    }
}
