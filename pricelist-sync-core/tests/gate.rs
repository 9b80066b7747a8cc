use std::time::Duration;

use chrono::Utc;
use pricelist_sync_core::gate::DedupGate;
use pricelist_sync_core::record::ListRecord;
use serde_json::json;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(10);

fn list(id: &str) -> ListRecord {
    ListRecord::new(id, Utc::now(), json!({ "id": id }))
}

#[test]
fn forwards_last_candidate_when_window_closes() {
    let mut gate = DedupGate::new(WINDOW);
    let t0 = Instant::now();

    let closes_at = gate.submit(list("a"), t0);
    assert_eq!(closes_at, t0 + WINDOW);
    // A later submission inside the window does not extend it.
    assert_eq!(gate.submit(list("b"), t0 + Duration::from_secs(4)), closes_at);

    assert!(gate.flush(t0 + Duration::from_secs(9), None).is_none());
    let forwarded = gate.flush(closes_at, None).expect("candidate");
    assert_eq!(forwarded.id, "b");
    assert_eq!(gate.deadline(), None);
    assert_eq!(gate.last_forwarded(), Some("b"));
}

#[test]
fn same_id_in_consecutive_windows_is_forwarded_once() {
    let mut gate = DedupGate::new(WINDOW);
    let t0 = Instant::now();

    let first = gate.submit(list("a"), t0);
    assert!(gate.flush(first, None).is_some());

    let second = gate.submit(list("a"), first + Duration::from_secs(1));
    assert!(gate.flush(second, None).is_none());
}

#[test]
fn candidate_matching_confirmed_latest_is_dropped() {
    let mut gate = DedupGate::new(WINDOW);
    let t0 = Instant::now();

    let closes_at = gate.submit(list("a"), t0);
    assert!(gate.flush(closes_at, Some("a")).is_none());
    assert_eq!(gate.last_forwarded(), None);
}

#[test]
fn flush_without_open_window_is_a_no_op() {
    let mut gate = DedupGate::new(WINDOW);
    assert!(gate.flush(Instant::now(), None).is_none());
}

#[test]
fn forgotten_id_can_be_forwarded_again() {
    let mut gate = DedupGate::new(WINDOW);
    let t0 = Instant::now();

    let first = gate.submit(list("a"), t0);
    assert!(gate.flush(first, None).is_some());
    gate.forget("a");
    assert_eq!(gate.last_forwarded(), None);

    let second = gate.submit(list("a"), first);
    assert_eq!(gate.flush(second, None).map(|r| r.id), Some("a".to_string()));
}
