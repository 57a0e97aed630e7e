//! Platform enforcement seam.

use crate::error::SyncResult;
use async_trait::async_trait;
use custodian_types::{LockMode, ReasonCategory};

/// Applies lock decisions to the device.
///
/// Implementations must be idempotent: the engine reasserts the persisted
/// state on every boot.
#[async_trait]
pub trait EnforcementExecutor: Send + Sync {
    async fn apply_lock(
        &self,
        mode: LockMode,
        reason: ReasonCategory,
        reason_text: &str,
    ) -> SyncResult<()>;

    /// Lifts any lock. `unlock_token` is the credential that authorised it,
    /// when there was one.
    async fn apply_unlock(&self, unlock_token: Option<&str>) -> SyncResult<()>;

    /// Removes management from the device.
    async fn apply_deactivation(&self) -> SyncResult<()>;
}

pub mod mock {
    use super::*;
    use crate::error::SyncError;
    use crate::transport::mock::CallJournal;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum EnforcementAction {
        Lock {
            mode: LockMode,
            reason: ReasonCategory,
            reason_text: String,
        },
        Unlock {
            token: Option<String>,
        },
        Deactivate,
    }

    /// Records every call; can be told to fail.
    #[derive(Default)]
    pub struct RecordingExecutor {
        actions: Mutex<Vec<EnforcementAction>>,
        failing: AtomicBool,
        delay: Mutex<Duration>,
        journal: Option<Arc<CallJournal>>,
    }

    impl RecordingExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_journal(mut self, journal: Arc<CallJournal>) -> Self {
            self.journal = Some(journal);
            self
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        /// Simulated time the platform takes to apply each action.
        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock().unwrap() = delay;
        }

        pub fn actions(&self) -> Vec<EnforcementAction> {
            self.actions.lock().unwrap().clone()
        }

        pub fn last(&self) -> Option<EnforcementAction> {
            self.actions.lock().unwrap().last().cloned()
        }

        async fn settle(&self) {
            let delay = *self.delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        fn record(&self, entry: String, action: EnforcementAction) -> SyncResult<()> {
            if let Some(journal) = &self.journal {
                journal.record(entry);
            }
            self.actions.lock().unwrap().push(action);
            if self.failing.load(Ordering::SeqCst) {
                return Err(SyncError::Enforcement("device policy manager refused".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl EnforcementExecutor for RecordingExecutor {
        async fn apply_lock(
            &self,
            mode: LockMode,
            reason: ReasonCategory,
            reason_text: &str,
        ) -> SyncResult<()> {
            self.settle().await;
            self.record(
                format!("apply_lock:{mode}:{reason}"),
                EnforcementAction::Lock {
                    mode,
                    reason,
                    reason_text: reason_text.to_string(),
                },
            )
        }

        async fn apply_unlock(&self, unlock_token: Option<&str>) -> SyncResult<()> {
            self.settle().await;
            self.record(
                "apply_unlock".into(),
                EnforcementAction::Unlock {
                    token: unlock_token.map(str::to_string),
                },
            )
        }

        async fn apply_deactivation(&self) -> SyncResult<()> {
            self.settle().await;
            self.record("apply_deactivation".into(), EnforcementAction::Deactivate)
        }
    }
}
