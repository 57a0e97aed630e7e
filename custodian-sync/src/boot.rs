//! Startup reconciliation.
//!
//! Before anything touches the network, the persisted lock state is pushed
//! back through the enforcement executor so a reboot can never open a window
//! in which a locked device runs unlocked. Only then is a single heartbeat
//! attempted to pick up whatever changed while the device was off.

use crate::error::SyncResult;
use crate::heartbeat::HeartbeatTask;
use crate::lock::{LoadSource, LockStateMachine};
use crate::reporter::CycleOutcome;
use custodian_types::LockState;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug)]
pub struct BootReport {
    /// State found in storage.
    pub restored: LockState,
    pub source: LoadSource,
    /// Whether the executor accepted the reassertion.
    pub reasserted: bool,
    /// `None` when the device is deactivated and no heartbeat was sent.
    pub heartbeat: Option<SyncResult<CycleOutcome>>,
    /// State after the boot heartbeat.
    pub current: LockState,
}

pub struct BootReconciler {
    lock: Arc<LockStateMachine>,
    heartbeat: Arc<dyn HeartbeatTask>,
    source: LoadSource,
}

impl BootReconciler {
    pub fn new(
        lock: Arc<LockStateMachine>,
        heartbeat: Arc<dyn HeartbeatTask>,
        source: LoadSource,
    ) -> Self {
        Self {
            lock,
            heartbeat,
            source,
        }
    }

    pub async fn run(&self) -> BootReport {
        let restored = self.lock.current().await;

        let reasserted = match self.source {
            LoadSource::Fresh => false,
            LoadSource::Primary | LoadSource::Shadow => self.lock.reassert().await,
        };
        info!(
            mode = %restored.mode,
            reason = %restored.reason_category,
            reasserted,
            "lock state reasserted at boot"
        );

        if restored.is_terminal() {
            info!("device deactivated, skipping boot heartbeat");
            return BootReport {
                current: restored.clone(),
                restored,
                source: self.source,
                reasserted,
                heartbeat: None,
            };
        }

        let heartbeat = self.heartbeat.run_cycle().await;
        if let Err(e) = &heartbeat {
            warn!(error = %e, "boot heartbeat failed");
        }

        BootReport {
            restored,
            source: self.source,
            reasserted,
            heartbeat: Some(heartbeat),
            current: self.lock.current().await,
        }
    }
}
