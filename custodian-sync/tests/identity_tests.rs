use custodian_storage::{DurableStore, MemoryStore};
use custodian_sync::identity::IDENTITY_KEY;
use custodian_sync::{IdentityError, IdentityManager, IdentityPolicy, StoreLocation, validate_identity};
use custodian_types::{Clock, ManualClock, Timestamp};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    primary: Arc<MemoryStore>,
    backups: Vec<Arc<MemoryStore>>,
    clock: Arc<ManualClock>,
    manager: IdentityManager,
}

fn make_fixture(backup_count: usize) -> Fixture {
    let primary = Arc::new(MemoryStore::new());
    let backups: Vec<Arc<MemoryStore>> = (0..backup_count).map(|_| Arc::new(MemoryStore::new())).collect();
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
    let manager = IdentityManager::new(
        StoreLocation::new("primary", primary.clone()),
        backups
            .iter()
            .enumerate()
            .map(|(i, s)| StoreLocation::new(format!("backup-{i}"), s.clone() as Arc<dyn DurableStore>))
            .collect(),
        IdentityPolicy::default(),
        clock.clone(),
    );
    Fixture {
        primary,
        backups,
        clock,
        manager,
    }
}

fn stored_id(store: &MemoryStore) -> Option<String> {
    let bytes = store.get(IDENTITY_KEY).unwrap()?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    value["id"].as_str().map(str::to_string)
}

// ── Validation ───────────────────────────────────────────────────

#[test]
fn blank_identity_rejected() {
    let policy = IdentityPolicy::default();
    assert_eq!(validate_identity("", &policy), Err(IdentityError::Blank));
    assert_eq!(validate_identity("   \t ", &policy), Err(IdentityError::Blank));
}

#[test]
fn placeholder_identities_rejected() {
    let policy = IdentityPolicy::default();
    for candidate in ["unknown", "NULL", "android_id", "9774d56d682e549c", "  Default  "] {
        assert!(
            matches!(validate_identity(candidate, &policy), Err(IdentityError::Placeholder(_))),
            "{candidate} should be a placeholder"
        );
    }
}

#[test]
fn repeated_character_identity_rejected() {
    let policy = IdentityPolicy::default();
    assert!(matches!(
        validate_identity("0000000000000000", &policy),
        Err(IdentityError::Placeholder(_))
    ));
}

#[test]
fn short_identity_rejected() {
    let policy = IdentityPolicy::default();
    assert_eq!(
        validate_identity("abc123", &policy),
        Err(IdentityError::TooShort { len: 6, min: 8 })
    );
}

#[test]
fn valid_identity_is_trimmed() {
    let policy = IdentityPolicy::default();
    assert_eq!(
        validate_identity("  device-4f2a91  ", &policy).unwrap(),
        "device-4f2a91"
    );
}

// ── set / get ────────────────────────────────────────────────────

#[test]
fn set_identity_fans_out_to_all_locations() {
    let f = make_fixture(2);
    f.manager.set_identity("device-4f2a91").unwrap();

    assert_eq!(stored_id(&f.primary).as_deref(), Some("device-4f2a91"));
    for backup in &f.backups {
        assert_eq!(stored_id(backup).as_deref(), Some("device-4f2a91"));
    }

    let identity = f.manager.get_identity().unwrap();
    assert_eq!(identity.id, "device-4f2a91");
    assert!(identity.validated);
    assert_eq!(identity.source_locations, vec!["primary", "backup-0", "backup-1"]);
}

#[test]
fn invalid_identity_writes_nothing() {
    let f = make_fixture(1);
    assert_eq!(f.manager.set_identity(""), Err(IdentityError::Blank));
    assert!(f.primary.get(IDENTITY_KEY).unwrap().is_none());
    assert!(f.backups[0].get(IDENTITY_KEY).unwrap().is_none());
    assert!(f.manager.get_identity().is_none());
}

#[test]
fn primary_failure_fails_the_write() {
    let f = make_fixture(1);
    f.primary.set_read_only(true);

    let err = f.manager.set_identity("device-4f2a91").unwrap_err();
    assert!(matches!(err, IdentityError::Storage(_)));
}

#[test]
fn backup_failure_does_not_fail_the_write() {
    let f = make_fixture(2);
    f.backups[1].set_read_only(true);

    f.manager.set_identity("device-4f2a91").unwrap();
    assert_eq!(stored_id(&f.backups[0]).as_deref(), Some("device-4f2a91"));
    assert!(f.backups[1].get(IDENTITY_KEY).unwrap().is_none());
}

#[test]
fn get_falls_back_to_backup_when_primary_missing() {
    let f = make_fixture(2);
    f.manager.set_identity("device-4f2a91").unwrap();
    f.primary.remove(IDENTITY_KEY).unwrap();

    let identity = f.manager.get_identity().unwrap();
    assert_eq!(identity.id, "device-4f2a91");
    assert_eq!(identity.source_locations[0], "backup-0");
}

#[test]
fn get_falls_back_when_primary_unreadable() {
    let f = make_fixture(1);
    f.manager.set_identity("device-4f2a91").unwrap();
    f.primary.set(IDENTITY_KEY, b"{corrupt").unwrap();

    assert_eq!(f.manager.get_identity().unwrap().id, "device-4f2a91");
}

#[test]
fn require_valid_without_identity() {
    let f = make_fixture(0);
    assert!(matches!(
        f.manager.require_valid(),
        Err(IdentityError::Invalid(_))
    ));
}

// ── verify_and_repair ────────────────────────────────────────────

#[test]
fn repair_rewrites_divergent_backup() {
    let f = make_fixture(2);
    f.manager.set_identity("device-4f2a91").unwrap();
    f.backups[1]
        .set(IDENTITY_KEY, br#"{"id":"someone-else-123","last_verified_at":0}"#)
        .unwrap();

    let report = f.manager.verify_and_repair();
    assert_eq!(report.identity.as_deref(), Some("device-4f2a91"));
    assert_eq!(report.checked, 3);
    assert_eq!(report.repaired, vec!["backup-1"]);
    assert!(report.failed.is_empty());
    assert_eq!(stored_id(&f.backups[1]).as_deref(), Some("device-4f2a91"));
}

#[test]
fn repair_restores_missing_primary_from_backup() {
    let f = make_fixture(2);
    f.manager.set_identity("device-4f2a91").unwrap();
    f.primary.remove(IDENTITY_KEY).unwrap();
    f.backups[0].remove(IDENTITY_KEY).unwrap();

    let report = f.manager.verify_and_repair();
    assert_eq!(report.primary_restored_from.as_deref(), Some("backup-1"));
    assert_eq!(report.repaired, vec!["backup-0"]);
    assert_eq!(stored_id(&f.primary).as_deref(), Some("device-4f2a91"));
    assert_eq!(stored_id(&f.backups[0]).as_deref(), Some("device-4f2a91"));
}

#[test]
fn repair_of_consistent_copies_is_clean() {
    let f = make_fixture(2);
    f.manager.set_identity("device-4f2a91").unwrap();

    let report = f.manager.verify_and_repair();
    assert!(report.is_consistent());
}

#[test]
fn repair_stamps_last_verified_at() {
    let f = make_fixture(1);
    f.manager.set_identity("device-4f2a91").unwrap();
    f.clock.advance(Duration::from_secs(3_600));

    f.manager.verify_and_repair();
    let identity = f.manager.get_identity().unwrap();
    assert_eq!(identity.last_verified_at, f.clock.now());
}

#[test]
fn repair_reports_unwritable_backup() {
    let f = make_fixture(1);
    f.manager.set_identity("device-4f2a91").unwrap();
    f.backups[0].remove(IDENTITY_KEY).unwrap();
    f.backups[0].set_read_only(true);

    let report = f.manager.verify_and_repair();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "backup-0");
}

#[test]
fn repair_with_no_identity_anywhere() {
    let f = make_fixture(2);
    let report = f.manager.verify_and_repair();
    assert!(report.identity.is_none());
    assert!(report.repaired.is_empty());
}

// ── reset ────────────────────────────────────────────────────────

#[test]
fn reset_clears_every_location() {
    let f = make_fixture(2);
    f.manager.set_identity("device-4f2a91").unwrap();
    f.manager.reset().unwrap();

    assert!(f.manager.get_identity().is_none());
    for backup in &f.backups {
        assert!(backup.get(IDENTITY_KEY).unwrap().is_none());
    }
}

// ── Properties ───────────────────────────────────────────────────

proptest! {
    #[test]
    fn whitespace_only_never_valid(ws in "[ \t\n\r]{0,16}") {
        prop_assert_eq!(validate_identity(&ws, &IdentityPolicy::default()), Err(IdentityError::Blank));
    }

    #[test]
    fn accepted_identities_round_trip(id in "[a-f0-9]{8}-[a-f0-9]{4}-[a-z0-9]{6,12}") {
        let f = make_fixture(2);
        f.manager.set_identity(&id).unwrap();
        let identity = f.manager.get_identity().unwrap();
        prop_assert_eq!(identity.id, id);
        prop_assert!(identity.validated);
        prop_assert_eq!(identity.source_locations.len(), 3);
    }
}
