//! Durable delivery backlog.
//!
//! Reports that could not be delivered live are appended here and retried
//! with exponential backoff. Delivered records become tombstones so a
//! replayed enqueue of the same id is recognised and ignored; tombstones and
//! permanently failed records are purged after the retention window.

use crate::config::RetryPolicy;
use crate::error::{SyncError, SyncResult, TransitionError};
use crate::identity::IdentityManager;
use crate::lock::{LockStateMachine, Transition};
use crate::transport::RemoteClient;
use custodian_storage::DurableStore;
use custodian_types::{Clock, RecordId, ReportStatus, StateSnapshot, TamperEvent, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Log name used in the durable store.
pub const QUEUE_LOG: &str = "sync_queue";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Heartbeat,
    Tamper,
}

/// One queued report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub id: RecordId,
    pub kind: RecordKind,
    /// Dropped from heartbeat tombstones once delivered.
    pub payload: Option<StateSnapshot>,
    pub recorded_at: Timestamp,
    pub sync_status: SyncStatus,
    pub retry_count: u32,
    pub next_attempt_at: Timestamp,
    /// When the status last changed; retention is measured from here.
    pub updated_at: Timestamp,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl HeartbeatRecord {
    /// A pending heartbeat report, due immediately.
    pub fn heartbeat(snapshot: StateSnapshot, now: Timestamp) -> Self {
        Self::pending(RecordKind::Heartbeat, snapshot, now)
    }

    /// A pending tamper report wrapping `event`.
    pub fn tamper(event: &TamperEvent, now: Timestamp) -> SyncResult<Self> {
        Ok(Self::pending(RecordKind::Tamper, tamper_payload(event)?, now))
    }

    fn pending(kind: RecordKind, payload: StateSnapshot, now: Timestamp) -> Self {
        Self {
            id: RecordId::new(),
            kind,
            payload: Some(payload),
            recorded_at: now,
            sync_status: SyncStatus::Pending,
            retry_count: 0,
            next_attempt_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    /// The tamper event carried by a tamper record.
    pub fn tamper_event(&self) -> Option<TamperEvent> {
        let value = self.payload.as_ref()?.as_value().get("tamper_event")?;
        serde_json::from_value(value.clone()).ok()
    }

    fn is_due(&self, now: Timestamp) -> bool {
        self.sync_status == SyncStatus::Pending && self.next_attempt_at <= now
    }

    fn mark_synced(&mut self, now: Timestamp) {
        self.sync_status = SyncStatus::Synced;
        self.updated_at = now;
        self.last_error = None;
        match self.kind {
            RecordKind::Heartbeat => self.payload = None,
            RecordKind::Tamper => {
                if let Some(mut event) = self.tamper_event() {
                    event.reported_status = ReportStatus::Reported;
                    if let Ok(payload) = tamper_payload(&event) {
                        self.payload = Some(payload);
                    }
                }
            }
        }
    }

    /// Records a failed attempt. Returns `true` if the record is now FAILED.
    fn mark_failed(&mut self, error: String, policy: &RetryPolicy, now: Timestamp) -> bool {
        self.retry_count += 1;
        self.updated_at = now;
        self.last_error = Some(error);
        if policy.exhausted(self.retry_count) {
            self.sync_status = SyncStatus::Failed;
            true
        } else {
            self.next_attempt_at = now.saturating_add(policy.delay_after(self.retry_count));
            false
        }
    }
}

fn tamper_payload(event: &TamperEvent) -> SyncResult<StateSnapshot> {
    let mut payload = serde_json::Map::new();
    payload.insert("tamper_event".into(), serde_json::to_value(event)?);
    Ok(StateSnapshot::new(serde_json::Value::Object(payload)))
}

/// Per-status record counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub synced: usize,
    pub failed: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.synced + self.failed
    }
}

/// What one drain pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub delivered: usize,
    /// Failed attempts that were rescheduled.
    pub retried: usize,
    /// Records that ran out of attempts during this pass.
    pub failed: usize,
    /// Directives refused by the lock state machine.
    pub discarded_directives: usize,
    pub transitions: Vec<Transition>,
    /// Most recent contact interval requested by the authority.
    pub next_contact_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another drain holds the queue.
    AlreadyRunning,
    Completed(DrainReport),
}

/// Clears the drain flag when a pass ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncQueue {
    store: Arc<dyn DurableStore>,
    remote: Arc<dyn RemoteClient>,
    identity: Arc<IdentityManager>,
    lock: Arc<LockStateMachine>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    send_timeout: Duration,
    draining: AtomicBool,
}

impl SyncQueue {
    pub fn new(
        store: Arc<dyn DurableStore>,
        remote: Arc<dyn RemoteClient>,
        identity: Arc<IdentityManager>,
        lock: Arc<LockStateMachine>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        send_timeout: Duration,
    ) -> Self {
        Self {
            store,
            remote,
            identity,
            lock,
            clock,
            retry,
            send_timeout,
            draining: AtomicBool::new(false),
        }
    }

    /// Persists a record. Returns `false` if a record with the same id was
    /// already queued or delivered.
    pub fn enqueue(&self, record: &HeartbeatRecord) -> SyncResult<bool> {
        let bytes = serde_json::to_vec(record)?;
        let added = self
            .store
            .append_to_log(QUEUE_LOG, &record.id.to_string(), &bytes)?;
        if added {
            debug!(id = %record.id, kind = ?record.kind, "record queued");
        } else {
            debug!(id = %record.id, "duplicate record ignored");
        }
        Ok(added)
    }

    /// Queues a report whose live delivery just failed. The first retry
    /// waits the initial backoff delay.
    pub fn enqueue_after_failure(
        &self,
        mut record: HeartbeatRecord,
        error: String,
    ) -> SyncResult<bool> {
        let now = self.clock.now();
        record.next_attempt_at = now.saturating_add(self.retry.delay_after(0));
        record.updated_at = now;
        record.last_error = Some(error);
        self.enqueue(&record)
    }

    /// Every record, oldest first. Undecodable entries are skipped.
    pub fn records(&self) -> SyncResult<Vec<HeartbeatRecord>> {
        let entries = self.store.list_log(QUEUE_LOG)?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_slice(&entry.value) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(id = %entry.record_id, error = %e, "skipping undecodable queue record");
                    None
                }
            })
            .collect())
    }

    /// PENDING records, oldest first, whether or not they are due.
    pub fn pending(&self) -> SyncResult<Vec<HeartbeatRecord>> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|r| r.sync_status == SyncStatus::Pending)
            .collect())
    }

    /// Records that exhausted their attempts and await cleanup.
    pub fn failed_records(&self) -> SyncResult<Vec<HeartbeatRecord>> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|r| r.sync_status == SyncStatus::Failed)
            .collect())
    }

    pub fn stats(&self) -> SyncResult<QueueStats> {
        let mut stats = QueueStats::default();
        for record in self.records()? {
            match record.sync_status {
                SyncStatus::Pending => stats.pending += 1,
                SyncStatus::Synced => stats.synced += 1,
                SyncStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    /// Delivers up to `batch_size` due records, oldest first.
    ///
    /// Only one drain runs at a time; a concurrent call returns
    /// [`DrainOutcome::AlreadyRunning`] without touching the queue.
    pub async fn drain(&self, batch_size: usize) -> SyncResult<DrainOutcome> {
        let Some(_guard) = DrainGuard::acquire(&self.draining) else {
            debug!("drain already in progress");
            return Ok(DrainOutcome::AlreadyRunning);
        };

        let identity = self.identity.require_valid()?;
        let now = self.clock.now();
        let batch: Vec<HeartbeatRecord> = self
            .records()?
            .into_iter()
            .filter(|r| r.is_due(now))
            .take(batch_size)
            .collect();

        let mut report = DrainReport::default();
        for mut record in batch {
            if self.lock.is_terminal().await {
                debug!("device deactivated, stopping drain");
                break;
            }

            report.attempted += 1;
            let payload = record.payload.clone().unwrap_or_else(StateSnapshot::empty);
            let sent = tokio::time::timeout(
                self.send_timeout,
                self.remote.send(&identity, &payload, record.retry_count),
            )
            .await
            .unwrap_or(Err(SyncError::Timeout));

            let now = self.clock.now();
            match sent {
                Ok(directive) => {
                    record.mark_synced(now);
                    self.update(&record)?;
                    report.delivered += 1;
                    if directive.next_contact_seconds.is_some() {
                        report.next_contact_seconds = directive.next_contact_seconds;
                    }
                    match self.lock.apply_directive(directive).await {
                        Ok(transition) => report.transitions.push(transition),
                        Err(TransitionError::Stale(_) | TransitionError::Terminal) => {
                            report.discarded_directives += 1;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => {
                    let exhausted = record.mark_failed(e.to_string(), &self.retry, now);
                    self.update(&record)?;
                    if exhausted {
                        report.failed += 1;
                        warn!(id = %record.id, attempts = record.retry_count, error = %e, "record delivery failed permanently");
                    } else {
                        report.retried += 1;
                        debug!(
                            id = %record.id,
                            attempt = record.retry_count,
                            next_attempt_at = %record.next_attempt_at,
                            error = %e,
                            "record delivery failed, rescheduled"
                        );
                    }
                }
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                delivered = report.delivered,
                retried = report.retried,
                failed = report.failed,
                "queue drained"
            );
        }
        Ok(DrainOutcome::Completed(report))
    }

    /// Deletes SYNCED and FAILED records older than `retention`.
    pub fn cleanup(&self, retention: Duration) -> SyncResult<usize> {
        let cutoff = self.clock.now().saturating_sub(retention);
        let mut removed = 0;
        for record in self.records()? {
            let settled = matches!(record.sync_status, SyncStatus::Synced | SyncStatus::Failed);
            if settled
                && record.updated_at < cutoff
                && self
                    .store
                    .delete_from_log(QUEUE_LOG, &record.id.to_string())?
            {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "expired queue records removed");
        }
        Ok(removed)
    }

    fn update(&self, record: &HeartbeatRecord) -> SyncResult<()> {
        let bytes = serde_json::to_vec(record)?;
        self.store
            .update_log(QUEUE_LOG, &record.id.to_string(), &bytes)?;
        Ok(())
    }
}
