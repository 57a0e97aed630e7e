//! Device identity with redundant storage.
//!
//! The identity is written to a primary store first, then fanned out to any
//! number of backup stores. Reads prefer the primary and fall back to the
//! backups in order. A periodic [`IdentityManager::verify_and_repair`] pass
//! restores divergent or missing copies from the canonical value.

use crate::config::IdentityPolicy;
use crate::error::IdentityError;
use custodian_storage::{DurableStore, get_json, set_json};
use custodian_types::{Clock, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Key under which every location keeps its copy.
pub const IDENTITY_KEY: &str = "device_identity";

/// A named store holding one copy of the identity.
#[derive(Clone)]
pub struct StoreLocation {
    name: String,
    store: Arc<dyn DurableStore>,
}

impl StoreLocation {
    pub fn new(name: impl Into<String>, store: Arc<dyn DurableStore>) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> CopyState {
        match get_json::<StoredIdentity>(self.store.as_ref(), IDENTITY_KEY) {
            Ok(Some(stored)) => CopyState::Present(stored),
            Ok(None) => CopyState::Missing,
            Err(e) => CopyState::Unreadable(e.to_string()),
        }
    }

    fn write(&self, stored: &StoredIdentity) -> Result<(), IdentityError> {
        set_json(self.store.as_ref(), IDENTITY_KEY, stored).map_err(IdentityError::from)
    }
}

impl fmt::Debug for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreLocation").field("name", &self.name).finish()
    }
}

/// The identity as resolved from storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: String,
    /// Locations holding this value, the one it was read from first.
    pub source_locations: Vec<String>,
    /// Whether the value passes the current identity policy.
    pub validated: bool,
    pub last_verified_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredIdentity {
    id: String,
    last_verified_at: Timestamp,
}

enum CopyState {
    Present(StoredIdentity),
    Missing,
    Unreadable(String),
}

/// Result of a verify-and-repair pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// The canonical identity, if any copy held a valid one.
    pub identity: Option<String>,
    /// Number of locations inspected.
    pub checked: usize,
    /// Locations rewritten with the canonical value.
    pub repaired: Vec<String>,
    /// Locations that could not be rewritten, with the error.
    pub failed: Vec<(String, String)>,
    /// Backup the primary copy was restored from.
    pub primary_restored_from: Option<String>,
}

impl RepairReport {
    /// Whether every copy already agreed.
    pub fn is_consistent(&self) -> bool {
        self.repaired.is_empty() && self.failed.is_empty() && self.primary_restored_from.is_none()
    }
}

/// Checks a candidate against `policy` and returns the trimmed value.
pub fn validate_identity(candidate: &str, policy: &IdentityPolicy) -> Result<String, IdentityError> {
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return Err(IdentityError::Blank);
    }

    if policy
        .placeholders
        .iter()
        .any(|p| p.eq_ignore_ascii_case(trimmed))
    {
        return Err(IdentityError::Placeholder(trimmed.to_string()));
    }

    // "0000000000", "xxxxxxxx" and friends
    let mut chars = trimmed.chars();
    if let Some(first) = chars.next() {
        if trimmed.chars().count() > 1 && chars.all(|c| c == first) {
            return Err(IdentityError::Placeholder(trimmed.to_string()));
        }
    }

    let len = trimmed.chars().count();
    if len < policy.min_length {
        return Err(IdentityError::TooShort {
            len,
            min: policy.min_length,
        });
    }

    Ok(trimmed.to_string())
}

/// Owns the device identity across its storage locations.
pub struct IdentityManager {
    primary: StoreLocation,
    backups: Vec<StoreLocation>,
    policy: IdentityPolicy,
    clock: Arc<dyn Clock>,
}

impl IdentityManager {
    pub fn new(
        primary: StoreLocation,
        backups: Vec<StoreLocation>,
        policy: IdentityPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            primary,
            backups,
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> &IdentityPolicy {
        &self.policy
    }

    /// Validates and stores a new identity.
    ///
    /// The primary write decides success. Backup failures are logged and
    /// left for the next repair pass.
    pub fn set_identity(&self, candidate: &str) -> Result<(), IdentityError> {
        let id = validate_identity(candidate, &self.policy)?;
        let stored = StoredIdentity {
            id,
            last_verified_at: self.clock.now(),
        };

        self.primary.write(&stored)?;

        let mut fanned_out = 0;
        for backup in &self.backups {
            match backup.write(&stored) {
                Ok(()) => fanned_out += 1,
                Err(e) => warn!(location = %backup.name, error = %e, "identity backup write failed"),
            }
        }

        info!(
            backups = fanned_out,
            of = self.backups.len(),
            "device identity registered"
        );
        Ok(())
    }

    /// Resolves the identity, primary first then backups in order.
    pub fn get_identity(&self) -> Option<DeviceIdentity> {
        let mut states = Vec::with_capacity(self.backups.len() + 1);
        states.push((self.primary.name.as_str(), self.primary.read()));
        for backup in &self.backups {
            states.push((backup.name.as_str(), backup.read()));
        }

        let (index, found) = states.iter().enumerate().find_map(|(i, (_, state))| match state {
            CopyState::Present(stored) => Some((i, stored.clone())),
            _ => None,
        })?;

        let mut source_locations = vec![states[index].0.to_string()];
        source_locations.extend(states.iter().enumerate().filter_map(|(i, (name, state))| {
            match state {
                CopyState::Present(other) if i != index && other.id == found.id => {
                    Some(name.to_string())
                }
                _ => None,
            }
        }));

        Some(DeviceIdentity {
            validated: validate_identity(&found.id, &self.policy).is_ok(),
            id: found.id,
            source_locations,
            last_verified_at: found.last_verified_at,
        })
    }

    /// Returns the identity only if one is stored and valid.
    pub fn require_valid(&self) -> Result<DeviceIdentity, IdentityError> {
        let identity = self
            .get_identity()
            .ok_or_else(|| IdentityError::Invalid("no identity registered".into()))?;
        if let Err(e) = validate_identity(&identity.id, &self.policy) {
            return Err(IdentityError::Invalid(e.to_string()));
        }
        Ok(identity)
    }

    /// Compares every copy with the canonical value and rewrites divergent ones.
    ///
    /// The primary is canonical when it holds a valid identity; otherwise it
    /// is restored from the first backup that does.
    pub fn verify_and_repair(&self) -> RepairReport {
        let mut report = RepairReport {
            checked: 1 + self.backups.len(),
            ..Default::default()
        };

        let primary_valid = match self.primary.read() {
            CopyState::Present(stored) if validate_identity(&stored.id, &self.policy).is_ok() => {
                Some(stored)
            }
            CopyState::Unreadable(e) => {
                warn!(location = %self.primary.name, error = %e, "primary identity unreadable");
                None
            }
            _ => None,
        };

        let canonical = match primary_valid {
            Some(stored) => stored,
            None => {
                let Some((name, stored)) = self.backups.iter().find_map(|b| match b.read() {
                    CopyState::Present(s) if validate_identity(&s.id, &self.policy).is_ok() => {
                        Some((b.name.clone(), s))
                    }
                    _ => None,
                }) else {
                    debug!("no valid identity in any location");
                    return report;
                };
                report.primary_restored_from = Some(name);
                stored
            }
        };

        let verified = StoredIdentity {
            id: canonical.id.clone(),
            last_verified_at: self.clock.now(),
        };
        if let Err(e) = self.primary.write(&verified) {
            report
                .failed
                .push((self.primary.name.clone(), e.to_string()));
        }

        for backup in &self.backups {
            match backup.read() {
                CopyState::Present(stored) if stored.id == canonical.id => continue,
                _ => {}
            }
            match backup.write(&verified) {
                Ok(()) => report.repaired.push(backup.name.clone()),
                Err(e) => report.failed.push((backup.name.clone(), e.to_string())),
            }
        }

        if let Some(from) = &report.primary_restored_from {
            warn!(from = %from, "primary identity restored from backup");
        }
        if !report.repaired.is_empty() || !report.failed.is_empty() {
            warn!(
                repaired = ?report.repaired,
                failed = report.failed.len(),
                "identity copies diverged"
            );
        } else {
            debug!(checked = report.checked, "identity copies consistent");
        }

        report.identity = Some(canonical.id);
        report
    }

    /// Removes the identity from every location.
    ///
    /// Only a primary failure is reported; backups are best effort.
    pub fn reset(&self) -> Result<(), IdentityError> {
        self.primary.store.remove(IDENTITY_KEY)?;
        for backup in &self.backups {
            if let Err(e) = backup.store.remove(IDENTITY_KEY) {
                warn!(location = %backup.name, error = %e, "identity backup removal failed");
            }
        }
        info!("device identity reset");
        Ok(())
    }
}
