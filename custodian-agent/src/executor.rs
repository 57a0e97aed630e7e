//! Status-file enforcement.
//!
//! Each decision is written atomically (temp file + rename) as JSON. The
//! platform service that renders the lock screen watches this file.

use async_trait::async_trait;
use custodian_sync::{EnforcementExecutor, SyncError, SyncResult};
use custodian_types::{Clock, LockMode, ReasonCategory, Timestamp};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Contents of the status file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcementStatus {
    pub mode: LockMode,
    pub reason: ReasonCategory,
    pub reason_text: String,
    /// `false` once the device has been released from management.
    pub managed: bool,
    pub unlocked_with_token: bool,
    pub updated_at: Timestamp,
}

pub struct StatusFileExecutor {
    path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl StatusFileExecutor {
    pub fn new(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            clock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the last published status.
    pub async fn read(&self) -> SyncResult<Option<EnforcementStatus>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::Enforcement(e.to_string())),
        }
    }

    async fn publish(&self, status: EnforcementStatus) -> SyncResult<()> {
        let bytes = serde_json::to_vec_pretty(&status)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| SyncError::Enforcement(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| SyncError::Enforcement(format!("rename {}: {e}", self.path.display())))?;
        info!(mode = %status.mode, reason = %status.reason, managed = status.managed, "enforcement status published");
        Ok(())
    }
}

#[async_trait]
impl EnforcementExecutor for StatusFileExecutor {
    async fn apply_lock(
        &self,
        mode: LockMode,
        reason: ReasonCategory,
        reason_text: &str,
    ) -> SyncResult<()> {
        self.publish(EnforcementStatus {
            mode,
            reason,
            reason_text: reason_text.to_string(),
            managed: true,
            unlocked_with_token: false,
            updated_at: self.clock.now(),
        })
        .await
    }

    async fn apply_unlock(&self, unlock_token: Option<&str>) -> SyncResult<()> {
        self.publish(EnforcementStatus {
            mode: LockMode::Unlocked,
            reason: ReasonCategory::None,
            reason_text: String::new(),
            managed: true,
            unlocked_with_token: unlock_token.is_some(),
            updated_at: self.clock.now(),
        })
        .await
    }

    async fn apply_deactivation(&self) -> SyncResult<()> {
        self.publish(EnforcementStatus {
            mode: LockMode::Unlocked,
            reason: ReasonCategory::Deactivation,
            reason_text: String::new(),
            managed: false,
            unlocked_with_token: false,
            updated_at: self.clock.now(),
        })
        .await
    }
}
