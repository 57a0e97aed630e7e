//! One heartbeat cycle: collect, send, apply, or queue on failure.

use crate::collector::DeviceStateCollector;
use crate::error::{SyncError, SyncResult, TransitionError};
use crate::heartbeat::HeartbeatTask;
use crate::identity::IdentityManager;
use crate::lock::{LockStateMachine, Transition};
use crate::queue::{HeartbeatRecord, SyncQueue};
use crate::transport::RemoteClient;
use async_trait::async_trait;
use custodian_types::{Clock, RecordId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The report reached the authority.
    Delivered {
        /// `None` when the directive was refused as stale.
        transition: Option<Transition>,
        next_contact_seconds: Option<u64>,
        deactivated: bool,
    },
    /// Delivery failed; the report was handed to the sync queue.
    Queued { record_id: RecordId, error: String },
    /// The device is deactivated and no longer reports.
    Skipped,
}

impl CycleOutcome {
    pub fn next_contact_seconds(&self) -> Option<u64> {
        match self {
            Self::Delivered {
                next_contact_seconds,
                ..
            } => *next_contact_seconds,
            _ => None,
        }
    }

    pub fn is_deactivated(&self) -> bool {
        matches!(
            self,
            Self::Delivered {
                deactivated: true,
                ..
            } | Self::Skipped
        )
    }
}

pub struct HeartbeatReporter {
    identity: Arc<IdentityManager>,
    collector: Arc<dyn DeviceStateCollector>,
    remote: Arc<dyn RemoteClient>,
    lock: Arc<LockStateMachine>,
    queue: Arc<SyncQueue>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    delivered: Option<Arc<Notify>>,
}

impl HeartbeatReporter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<IdentityManager>,
        collector: Arc<dyn DeviceStateCollector>,
        remote: Arc<dyn RemoteClient>,
        lock: Arc<LockStateMachine>,
        queue: Arc<SyncQueue>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            identity,
            collector,
            remote,
            lock,
            queue,
            clock,
            timeout,
            delivered: None,
        }
    }

    /// Signalled after every successful live delivery, so the backlog can be
    /// drained while the authority is known to be reachable.
    pub fn with_delivery_signal(mut self, signal: Arc<Notify>) -> Self {
        self.delivered = Some(signal);
        self
    }

    pub async fn run_cycle(&self) -> SyncResult<CycleOutcome> {
        if self.lock.is_terminal().await {
            return Ok(CycleOutcome::Skipped);
        }

        let identity = self.identity.require_valid()?;
        let snapshot = self.collector.collect().await?;

        let sent = tokio::time::timeout(self.timeout, self.remote.send(&identity, &snapshot, 0))
            .await
            .unwrap_or(Err(SyncError::Timeout));

        let directive = match sent {
            Ok(directive) => directive,
            Err(e) => {
                let record = HeartbeatRecord::heartbeat(snapshot, self.clock.now());
                let record_id = record.id;
                self.queue.enqueue_after_failure(record, e.to_string())?;
                warn!(id = %record_id, error = %e, "heartbeat delivery failed, queued");
                return Ok(CycleOutcome::Queued {
                    record_id,
                    error: e.to_string(),
                });
            }
        };

        if let Some(signal) = &self.delivered {
            signal.notify_one();
        }

        let next_contact_seconds = directive.next_contact_seconds;
        let transition = match self.lock.apply_directive(directive).await {
            Ok(transition) => Some(transition),
            Err(TransitionError::Stale(conflict)) => {
                debug!(%conflict, "heartbeat directive discarded");
                None
            }
            Err(TransitionError::Terminal) => None,
            Err(e) => return Err(e.into()),
        };
        let deactivated = self.lock.is_terminal().await;

        info!(
            mode = ?transition.as_ref().map(|t| t.to.mode),
            next_contact_seconds,
            "heartbeat delivered"
        );
        Ok(CycleOutcome::Delivered {
            transition,
            next_contact_seconds,
            deactivated,
        })
    }
}

#[async_trait]
impl HeartbeatTask for HeartbeatReporter {
    async fn run_cycle(&self) -> SyncResult<CycleOutcome> {
        HeartbeatReporter::run_cycle(self).await
    }
}
