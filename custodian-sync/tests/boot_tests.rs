use custodian_storage::{DurableStore, MemoryStore};
use custodian_sync::enforcement::mock::{EnforcementAction, RecordingExecutor};
use custodian_sync::lock::LOCK_STATE_KEY;
use custodian_sync::transport::mock::{CallJournal, MockRemoteClient};
use custodian_sync::{
    BootReconciler, CycleOutcome, HeartbeatReporter, IdentityManager, IdentityPolicy, LoadSource,
    LockStateMachine, RetryPolicy, StaticCollector, StoreLocation, SyncQueue,
};
use custodian_types::{
    Directive, LockMode, ManualClock, ReasonCategory, Severity, TamperEvent, Timestamp,
};
use std::sync::Arc;
use std::time::Duration;

struct Device {
    lock_store: Arc<MemoryStore>,
    queue_store: Arc<MemoryStore>,
    identity_store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
}

impl Device {
    fn new() -> Self {
        Self {
            lock_store: Arc::new(MemoryStore::new()),
            queue_store: Arc::new(MemoryStore::new()),
            identity_store: Arc::new(MemoryStore::new()),
            clock: Arc::new(ManualClock::new(Timestamp::from_millis(10_000))),
        }
    }

    fn identity(&self) -> Arc<IdentityManager> {
        Arc::new(IdentityManager::new(
            StoreLocation::new("primary", self.identity_store.clone()),
            vec![],
            IdentityPolicy::default(),
            self.clock.clone(),
        ))
    }

    /// Simulates one process lifetime: open everything and build a reconciler.
    fn boot(
        &self,
        executor: Arc<RecordingExecutor>,
        remote: Arc<MockRemoteClient>,
    ) -> (BootReconciler, Arc<LockStateMachine>) {
        let identity = self.identity();
        let (lock, source) = LockStateMachine::open(
            self.lock_store.clone(),
            executor,
            self.clock.clone(),
            Severity::Low,
        )
        .unwrap();
        let lock = Arc::new(lock);
        let queue = Arc::new(SyncQueue::new(
            self.queue_store.clone(),
            remote.clone(),
            identity.clone(),
            lock.clone(),
            self.clock.clone(),
            RetryPolicy::default(),
            Duration::from_secs(30),
        ));
        let reporter = Arc::new(HeartbeatReporter::new(
            identity,
            Arc::new(StaticCollector::default()),
            remote,
            lock.clone(),
            queue,
            self.clock.clone(),
            Duration::from_secs(30),
        ));
        (
            BootReconciler::new(lock.clone(), reporter, source),
            lock,
        )
    }
}

fn make_device() -> Device {
    let device = Device::new();
    device.identity().set_identity("device-4f2a91").unwrap();
    device
}

async fn tamper_lock(device: &Device) {
    let (_, lock) = device.boot(
        Arc::new(RecordingExecutor::new()),
        Arc::new(MockRemoteClient::new()),
    );
    lock.apply_tamper(&TamperEvent::new(
        "root_detected",
        Severity::High,
        "su binary present",
        Timestamp::from_millis(9_000),
    ))
    .await
    .unwrap();
}

// ── Reassertion ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn tamper_lock_reasserted_before_network() {
    let device = make_device();
    tamper_lock(&device).await;

    let journal = CallJournal::new();
    let executor = Arc::new(RecordingExecutor::new().with_journal(journal.clone()));
    let remote = Arc::new(MockRemoteClient::new().with_journal(journal.clone()));
    remote.set_delay(Duration::from_secs(5));
    remote.set_default(Directive::unlock().issued_at(Timestamp::from_millis(1_000)));

    let (reconciler, _) = device.boot(executor.clone(), remote);
    let report = reconciler.run().await;

    let lock_at = journal.position("apply_lock:HARD_LOCKED:TAMPER").unwrap();
    let send_at = journal.position("send:start").unwrap();
    let done_at = journal.position("send:ok").unwrap();
    assert!(lock_at < send_at);
    assert!(lock_at < done_at);

    assert!(report.reasserted);
    assert_eq!(report.source, LoadSource::Primary);
    assert_eq!(report.restored.reason_category, ReasonCategory::Tamper);
    // The authority's answer predates the tamper detection.
    assert_eq!(report.current.mode, LockMode::HardLocked);
    assert_eq!(
        executor.actions()[0],
        EnforcementAction::Lock {
            mode: LockMode::HardLocked,
            reason: ReasonCategory::Tamper,
            reason_text: "su binary present".into(),
        }
    );
}

#[tokio::test]
async fn unlocked_state_reasserted_as_unlock() {
    let device = make_device();
    {
        let (_, lock) = device.boot(
            Arc::new(RecordingExecutor::new()),
            Arc::new(MockRemoteClient::new()),
        );
        lock.apply_directive(Directive::new(LockMode::HardLocked, ReasonCategory::Overdue))
            .await
            .unwrap();
        lock.apply_directive(Directive::unlock()).await.unwrap();
    }

    let executor = Arc::new(RecordingExecutor::new());
    let (reconciler, _) = device.boot(executor.clone(), Arc::new(MockRemoteClient::new()));
    let report = reconciler.run().await;

    assert!(report.reasserted);
    assert_eq!(executor.actions()[0], EnforcementAction::Unlock { token: None });
}

#[tokio::test]
async fn first_boot_does_not_reassert() {
    let device = make_device();
    let executor = Arc::new(RecordingExecutor::new());
    let remote = Arc::new(MockRemoteClient::new());

    let (reconciler, _) = device.boot(executor.clone(), remote.clone());
    let report = reconciler.run().await;

    assert_eq!(report.source, LoadSource::Fresh);
    assert!(!report.reasserted);
    assert!(executor.actions().is_empty());
    assert_eq!(remote.send_count(), 1);
}

#[tokio::test]
async fn shadow_copy_is_reasserted() {
    let device = make_device();
    tamper_lock(&device).await;
    device.lock_store.set(LOCK_STATE_KEY, b"torn write").unwrap();

    let executor = Arc::new(RecordingExecutor::new());
    let (reconciler, _) = device.boot(executor.clone(), Arc::new(MockRemoteClient::new()));
    let report = reconciler.run().await;

    assert_eq!(report.source, LoadSource::Shadow);
    assert!(report.reasserted);
    assert!(matches!(
        executor.actions()[0],
        EnforcementAction::Lock {
            mode: LockMode::HardLocked,
            ..
        }
    ));
}

// ── Boot heartbeat ───────────────────────────────────────────────

#[tokio::test]
async fn boot_heartbeat_picks_up_new_directive() {
    let device = make_device();
    let remote = Arc::new(MockRemoteClient::new());
    remote.push_response(Ok(Directive::new(
        LockMode::SoftLocked,
        ReasonCategory::Overdue,
    )));

    let (reconciler, _) = device.boot(Arc::new(RecordingExecutor::new()), remote);
    let report = reconciler.run().await;

    assert!(matches!(
        report.heartbeat,
        Some(Ok(CycleOutcome::Delivered { .. }))
    ));
    assert_eq!(report.current.mode, LockMode::SoftLocked);
}

#[tokio::test]
async fn offline_boot_keeps_last_state_and_queues() {
    let device = make_device();
    tamper_lock(&device).await;

    let remote = Arc::new(MockRemoteClient::new());
    remote.set_offline(true);
    let (reconciler, _) = device.boot(Arc::new(RecordingExecutor::new()), remote);
    let report = reconciler.run().await;

    assert!(matches!(report.heartbeat, Some(Ok(CycleOutcome::Queued { .. }))));
    assert_eq!(report.current.mode, LockMode::HardLocked);
}

#[tokio::test]
async fn deactivated_device_reapplies_teardown_without_heartbeat() {
    let device = make_device();
    {
        let failing = Arc::new(RecordingExecutor::new());
        failing.set_failing(true);
        let (_, lock) = device.boot(failing, Arc::new(MockRemoteClient::new()));
        let transition = lock.apply_directive(Directive::deactivate()).await.unwrap();
        assert!(!transition.enforced);
    }

    let executor = Arc::new(RecordingExecutor::new());
    let remote = Arc::new(MockRemoteClient::new());
    let (reconciler, lock) = device.boot(executor.clone(), remote.clone());
    let report = reconciler.run().await;

    assert!(report.reasserted);
    assert_eq!(executor.actions(), vec![EnforcementAction::Deactivate]);
    assert!(lock.last_enforcement_succeeded());
    assert!(report.heartbeat.is_none());
    assert!(report.current.is_terminal());
    assert_eq!(remote.send_count(), 0);
}
