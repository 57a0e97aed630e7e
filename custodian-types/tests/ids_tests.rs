use custodian_types::RecordId;
use std::collections::HashSet;

#[test]
fn record_ids_are_unique() {
    let ids: HashSet<RecordId> = (0..1000).map(|_| RecordId::new()).collect();
    assert_eq!(ids.len(), 1000);
}

#[test]
fn record_ids_sort_in_creation_order() {
    let first = RecordId::new();
    std::thread::sleep(std::time::Duration::from_millis(2));
    let second = RecordId::new();
    assert!(first < second);
}

#[test]
fn record_id_display_parse_roundtrip() {
    let id = RecordId::new();
    let parsed: RecordId = id.to_string().parse().unwrap();
    assert_eq!(parsed, id);
    assert_eq!(RecordId::parse(&id.to_string()).unwrap(), id);
}

#[test]
fn record_id_parse_rejects_garbage() {
    assert!(RecordId::parse("not-a-uuid").is_err());
}

#[test]
fn record_id_serializes_as_plain_string() {
    let id = RecordId::new();
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, format!("\"{id}\""));
}
