use custodian_types::{Clock, ManualClock, SystemClock, Timestamp};
use std::time::Duration;

#[test]
fn now_is_after_epoch() {
    assert!(Timestamp::now() > Timestamp::EPOCH);
    assert!(SystemClock.now().as_millis() > 0);
}

#[test]
fn arithmetic_saturates() {
    let ts = Timestamp::from_millis(500);
    assert_eq!(ts.saturating_add(Duration::from_secs(1)).as_millis(), 1500);
    assert_eq!(ts.saturating_sub(Duration::from_secs(1)), Timestamp::EPOCH);
    assert_eq!(
        Timestamp::from_millis(u64::MAX).saturating_add(Duration::from_secs(1)),
        Timestamp::from_millis(u64::MAX)
    );
}

#[test]
fn duration_since_is_zero_for_later_earlier() {
    let a = Timestamp::from_millis(1_000);
    let b = Timestamp::from_millis(4_000);
    assert_eq!(b.duration_since(a), Duration::from_secs(3));
    assert_eq!(a.duration_since(b), Duration::ZERO);
}

#[test]
fn display_is_rfc3339() {
    let ts = Timestamp::from_millis(1_700_000_000_123);
    assert_eq!(ts.to_string(), "2023-11-14T22:13:20.123Z");
}

#[test]
fn manual_clock_moves_only_when_told() {
    let clock = ManualClock::new(Timestamp::from_millis(100));
    assert_eq!(clock.now().as_millis(), 100);
    clock.advance(Duration::from_millis(20));
    assert_eq!(clock.now().as_millis(), 120);
    clock.set(Timestamp::from_millis(5));
    assert_eq!(clock.now().as_millis(), 5);
}

#[test]
fn timestamp_serializes_as_number() {
    let json = serde_json::to_string(&Timestamp::from_millis(42)).unwrap();
    assert_eq!(json, "42");
}
