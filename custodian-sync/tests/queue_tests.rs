use custodian_storage::MemoryStore;
use custodian_sync::enforcement::mock::RecordingExecutor;
use custodian_sync::transport::mock::MockRemoteClient;
use custodian_sync::{
    DrainOutcome, DrainReport, HeartbeatRecord, IdentityManager, IdentityPolicy, LockStateMachine,
    RecordKind, RetryPolicy, StoreLocation, SyncError, SyncQueue, SyncStatus,
};
use custodian_types::{
    Clock, Directive, LockMode, ManualClock, ReasonCategory, ReportStatus, Severity,
    StateSnapshot, TamperEvent, Timestamp,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    clock: Arc<ManualClock>,
    remote: Arc<MockRemoteClient>,
    identity: Arc<IdentityManager>,
    lock: Arc<LockStateMachine>,
    queue: SyncQueue,
}

fn make_fixture() -> Fixture {
    make_fixture_with_timeout(Duration::from_secs(30))
}

fn make_fixture_with_timeout(send_timeout: Duration) -> Fixture {
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000_000)));
    let remote = Arc::new(MockRemoteClient::new());
    let identity = Arc::new(IdentityManager::new(
        StoreLocation::new("primary", Arc::new(MemoryStore::new())),
        vec![],
        IdentityPolicy::default(),
        clock.clone(),
    ));
    identity.set_identity("device-4f2a91").unwrap();
    let (lock, _) = LockStateMachine::open(
        Arc::new(MemoryStore::new()),
        Arc::new(RecordingExecutor::new()),
        clock.clone(),
        Severity::Low,
    )
    .unwrap();
    let lock = Arc::new(lock);
    let queue = SyncQueue::new(
        Arc::new(MemoryStore::new()),
        remote.clone(),
        identity.clone(),
        lock.clone(),
        clock.clone(),
        RetryPolicy::default(),
        send_timeout,
    );
    Fixture {
        clock,
        remote,
        identity,
        lock,
        queue,
    }
}

fn make_record(f: &Fixture, seq: u64) -> HeartbeatRecord {
    HeartbeatRecord::heartbeat(StateSnapshot::new(json!({ "seq": seq })), f.clock.now())
}

fn completed(outcome: DrainOutcome) -> DrainReport {
    match outcome {
        DrainOutcome::Completed(report) => report,
        DrainOutcome::AlreadyRunning => panic!("drain unexpectedly already running"),
    }
}

// ── Enqueue ──────────────────────────────────────────────────────

#[test]
fn enqueue_persists_pending_record() {
    let f = make_fixture();
    let record = make_record(&f, 1);

    assert!(f.queue.enqueue(&record).unwrap());
    let pending = f.queue.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, record.id);
    assert_eq!(pending[0].sync_status, SyncStatus::Pending);
    assert_eq!(pending[0].retry_count, 0);
}

#[test]
fn duplicate_enqueue_is_ignored() {
    let f = make_fixture();
    let record = make_record(&f, 1);

    assert!(f.queue.enqueue(&record).unwrap());
    assert!(!f.queue.enqueue(&record).unwrap());
    assert_eq!(f.queue.stats().unwrap().total(), 1);
}

// ── Draining ─────────────────────────────────────────────────────

#[tokio::test]
async fn drain_respects_batch_size_oldest_first() {
    let f = make_fixture();
    for seq in 0..12 {
        f.queue.enqueue(&make_record(&f, seq)).unwrap();
    }

    let first = completed(f.queue.drain(10).await.unwrap());
    assert_eq!(first.attempted, 10);
    assert_eq!(first.delivered, 10);
    assert_eq!(f.queue.pending().unwrap().len(), 2);

    let second = completed(f.queue.drain(10).await.unwrap());
    assert_eq!(second.delivered, 2);
    assert!(f.queue.pending().unwrap().is_empty());

    let order: Vec<u64> = f
        .remote
        .sent()
        .iter()
        .map(|s| s.snapshot.as_value()["seq"].as_u64().unwrap())
        .collect();
    assert_eq!(order, (0..12).collect::<Vec<_>>());
    assert!(f.remote.sent().iter().all(|s| s.device_id == "device-4f2a91"));
}

#[tokio::test]
async fn delivered_record_becomes_tombstone() {
    let f = make_fixture();
    let record = make_record(&f, 1);
    f.queue.enqueue(&record).unwrap();

    completed(f.queue.drain(10).await.unwrap());

    let records = f.queue.records().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].sync_status, SyncStatus::Synced);
    assert!(records[0].payload.is_none());
}

#[tokio::test]
async fn redelivering_synced_record_is_noop() {
    let f = make_fixture();
    let record = make_record(&f, 1);
    f.queue.enqueue(&record).unwrap();
    completed(f.queue.drain(10).await.unwrap());

    assert!(!f.queue.enqueue(&record).unwrap());
    let report = completed(f.queue.drain(10).await.unwrap());

    assert_eq!(report.attempted, 0);
    assert_eq!(f.remote.send_count(), 1);
}

#[tokio::test]
async fn drain_forwards_directive_to_lock_machine() {
    let f = make_fixture();
    f.remote.push_response(Ok(Directive::new(
        LockMode::HardLocked,
        ReasonCategory::Overdue,
    )
    .with_next_contact(600)));
    f.queue.enqueue(&make_record(&f, 1)).unwrap();

    let report = completed(f.queue.drain(10).await.unwrap());

    assert_eq!(report.transitions.len(), 1);
    assert_eq!(report.next_contact_seconds, Some(600));
    assert_eq!(f.lock.current().await.mode, LockMode::HardLocked);
}

#[tokio::test]
async fn drain_stops_after_deactivation() {
    let f = make_fixture();
    f.remote.push_response(Ok(Directive::deactivate()));
    for seq in 0..3 {
        f.queue.enqueue(&make_record(&f, seq)).unwrap();
    }

    let report = completed(f.queue.drain(10).await.unwrap());

    assert_eq!(report.attempted, 1);
    assert!(f.lock.is_terminal().await);
    assert_eq!(f.queue.pending().unwrap().len(), 2);
}

#[tokio::test]
async fn drain_without_identity_fails() {
    let f = make_fixture();
    f.identity.reset().unwrap();
    f.queue.enqueue(&make_record(&f, 1)).unwrap();

    let err = f.queue.drain(10).await.unwrap_err();
    assert!(matches!(err, SyncError::Identity(_)));
    assert_eq!(f.queue.pending().unwrap()[0].retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_drain_is_rejected() {
    let f = make_fixture();
    f.remote.set_delay(Duration::from_secs(1));
    f.queue.enqueue(&make_record(&f, 1)).unwrap();

    let (first, second) = tokio::join!(f.queue.drain(10), f.queue.drain(10));

    assert_eq!(completed(first.unwrap()).delivered, 1);
    assert_eq!(second.unwrap(), DrainOutcome::AlreadyRunning);
    assert_eq!(f.remote.send_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_authority_counts_as_failure() {
    let f = make_fixture_with_timeout(Duration::from_secs(5));
    f.remote.set_delay(Duration::from_secs(60));
    f.queue.enqueue(&make_record(&f, 1)).unwrap();

    let report = completed(f.queue.drain(10).await.unwrap());

    assert_eq!(report.retried, 1);
    let record = &f.queue.pending().unwrap()[0];
    assert_eq!(record.retry_count, 1);
    assert_eq!(record.last_error.as_deref(), Some("operation timed out"));
}

// ── Backoff & failure ────────────────────────────────────────────

#[test]
fn retry_policy_doubles_then_caps() {
    let policy = RetryPolicy::default();
    let delays: Vec<u64> = (0..=6).map(|n| policy.delay_after(n).as_secs()).collect();
    assert_eq!(delays, vec![1, 2, 4, 8, 16, 16, 16]);
    assert!(!policy.exhausted(4));
    assert!(policy.exhausted(5));
}

#[test]
fn report_queued_after_live_failure_waits_initial_delay() {
    let f = make_fixture();
    let record = make_record(&f, 1);
    let id = record.id;

    assert!(f
        .queue
        .enqueue_after_failure(record, "authority unreachable".into())
        .unwrap());

    let pending = &f.queue.pending().unwrap()[0];
    assert_eq!(pending.id, id);
    assert_eq!(pending.retry_count, 0);
    assert_eq!(
        pending.next_attempt_at,
        f.clock.now().saturating_add(Duration::from_secs(1))
    );
    assert_eq!(pending.last_error.as_deref(), Some("authority unreachable"));
}

#[tokio::test]
async fn record_fails_after_five_attempts_with_backoff() {
    let f = make_fixture();
    f.remote.set_offline(true);
    let record = make_record(&f, 1);
    let id = record.id;
    f.queue
        .enqueue_after_failure(record, "authority unreachable".into())
        .unwrap();

    let mut last_event = f.clock.now();
    let mut gaps = Vec::new();
    for attempt in 1..=5u32 {
        let due = f.queue.pending().unwrap()[0].next_attempt_at;
        gaps.push(due.duration_since(last_event).as_secs());

        // Not due yet: nothing is sent.
        f.clock.set(due.saturating_sub(Duration::from_millis(1)));
        assert_eq!(completed(f.queue.drain(10).await.unwrap()).attempted, 0);

        f.clock.set(due);
        last_event = due;
        let report = completed(f.queue.drain(10).await.unwrap());
        if attempt < 5 {
            assert_eq!(report.retried, 1, "attempt {attempt}");
            assert_eq!(f.queue.pending().unwrap()[0].retry_count, attempt);
        } else {
            assert_eq!(report.failed, 1);
        }
    }
    assert_eq!(gaps, vec![1, 2, 4, 8, 16]);

    let failed = f.queue.failed_records().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, id);
    assert_eq!(failed[0].retry_count, 5);
    assert_eq!(f.remote.send_count(), 5);

    let retry_counts: Vec<u32> = f.remote.sent().iter().map(|s| s.retry_count).collect();
    assert_eq!(retry_counts, vec![0, 1, 2, 3, 4]);

    // FAILED records are never retried.
    f.clock.advance(Duration::from_secs(3_600));
    assert_eq!(completed(f.queue.drain(10).await.unwrap()).attempted, 0);

    // Still present 24h later, gone after 25h.
    f.clock.set(hours_after(last_event, 24));
    assert_eq!(f.queue.cleanup(Duration::from_secs(24 * 60 * 60)).unwrap(), 0);
    f.clock.set(hours_after(last_event, 25));
    assert_eq!(f.queue.cleanup(Duration::from_secs(24 * 60 * 60)).unwrap(), 1);
    assert!(f.queue.records().unwrap().is_empty());
}

fn hours_after(ts: Timestamp, hours: u64) -> Timestamp {
    ts.saturating_add(Duration::from_secs(hours * 60 * 60))
}

// ── Cleanup ──────────────────────────────────────────────────────

#[tokio::test]
async fn cleanup_removes_only_expired_settled_records() {
    let f = make_fixture();
    f.remote.set_offline(true);
    let failing = make_record(&f, 1);
    f.queue.enqueue(&failing).unwrap();
    for _ in 0..5 {
        completed(f.queue.drain(10).await.unwrap());
        f.clock.advance(Duration::from_secs(16));
    }
    assert_eq!(f.queue.failed_records().unwrap().len(), 1);

    f.remote.set_offline(false);
    f.queue.enqueue(&make_record(&f, 2)).unwrap();
    completed(f.queue.drain(10).await.unwrap());

    f.clock.advance(Duration::from_secs(60 * 60));
    f.remote.set_offline(true);
    let fresh = make_record(&f, 3);
    f.queue.enqueue(&fresh).unwrap();

    let day = Duration::from_secs(24 * 60 * 60);
    assert_eq!(f.queue.cleanup(day).unwrap(), 0);

    f.clock.advance(Duration::from_secs(24 * 60 * 60));
    assert_eq!(f.queue.cleanup(day).unwrap(), 2);

    let remaining = f.queue.records().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, fresh.id);
    assert_eq!(remaining[0].sync_status, SyncStatus::Pending);
}

// ── Tamper records ───────────────────────────────────────────────

#[tokio::test]
async fn delivered_tamper_record_is_marked_reported() {
    let f = make_fixture();
    let event = TamperEvent::new(
        "root_detected",
        Severity::High,
        "su binary present",
        f.clock.now(),
    );
    let record = HeartbeatRecord::tamper(&event, f.clock.now()).unwrap();
    assert_eq!(record.kind, RecordKind::Tamper);
    f.queue.enqueue(&record).unwrap();

    completed(f.queue.drain(10).await.unwrap());

    let stored = &f.queue.records().unwrap()[0];
    assert_eq!(stored.sync_status, SyncStatus::Synced);
    let reported = stored.tamper_event().unwrap();
    assert_eq!(reported.reported_status, ReportStatus::Reported);
    assert_eq!(reported.tamper_type, "root_detected");
}

#[tokio::test]
async fn stats_count_each_status() {
    let f = make_fixture();
    f.queue.enqueue(&make_record(&f, 1)).unwrap();
    completed(f.queue.drain(10).await.unwrap());
    f.queue.enqueue(&make_record(&f, 2)).unwrap();

    let stats = f.queue.stats().unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.synced, 1);
    assert_eq!(stats.failed, 0);
}
