use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use pricelist_sync_core::clock::TokioClock;
use pricelist_sync_core::config::SyncConfig;
use futures::stream::{self, StreamExt};
use pricelist_sync_core::contract::{
    Change, ChangeBatch, ChangeKind, ListStore, MockListSource, MockListStore,
};
use pricelist_sync_core::error::{SourceError, StoreError};
use pricelist_sync_core::record::{ListRecord, StoredList};
use pricelist_sync_core::store::MemoryListStore;
use pricelist_sync_core::synchronise::{SyncLoop, SyncState};
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};

fn anchor() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn upstream(id: &str, valid_for: chrono::Duration) -> Value {
    json!({
        "id": id,
        "validUntil": (anchor() + valid_for).to_rfc3339(),
        "legs": []
    })
}

fn fast_config() -> SyncConfig {
    SyncConfig {
        retention: 15,
        throttle_window_ms: 1_000,
        retry_base_delay_ms: 1_000,
        max_fetch_attempts: 3,
        grace_delay_ms: 5_000,
        safety_margin_ms: 5,
        progress_interval_ms: 5_000,
    }
}

/// Source that serves `responses` in order, repeating the last one, and records call times.
fn scripted_source(
    responses: Vec<Result<Value, ()>>,
) -> (MockListSource, Arc<Mutex<Vec<Instant>>>) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let seen = calls.clone();
    let mut source = MockListSource::new();
    source.expect_fetch_latest().returning(move || {
        let mut seen = seen.lock().unwrap();
        seen.push(Instant::now());
        let idx = (seen.len() - 1).min(responses.len() - 1);
        responses[idx]
            .clone()
            .map_err(|_| SourceError::Network("unreachable".into()))
    });
    (source, calls)
}

fn ids(store: &MemoryListStore) -> Vec<String> {
    store
        .snapshot()
        .unwrap()
        .into_iter()
        .map(|l| l.record.id)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn cold_start_fetches_once_and_persists_once() {
    let (source, calls) = scripted_source(vec![Ok(upstream("a", chrono::Duration::hours(1)))]);
    let store = Arc::new(MemoryListStore::new());
    let sync = SyncLoop::new(
        fast_config(),
        Arc::new(source),
        store.clone(),
        Arc::new(TokioClock::starting_at(anchor())),
    );
    let status = sync.status();
    let handle = tokio::spawn(sync.run());

    sleep(Duration::from_secs(2)).await;
    assert_eq!(ids(&store), vec!["a"]);
    assert_eq!(status.borrow().latest_id.as_deref(), Some("a"));
    assert_eq!(status.borrow().state, SyncState::IdleWaiting);

    // Nothing more happens while the list is valid.
    sleep(Duration::from_secs(30 * 60)).await;
    assert_eq!(calls.lock().unwrap().len(), 1);
    assert_eq!(ids(&store), vec!["a"]);
    assert_eq!(status.borrow().forwarded, 1);

    handle.abort();
}

#[tokio::test(start_paused = true)]
async fn refetches_just_after_expiry_and_prunes_old_list() {
    let (source, calls) = scripted_source(vec![
        Ok(upstream("a", chrono::Duration::seconds(10))),
        Ok(upstream("b", chrono::Duration::hours(1))),
    ]);
    let store = Arc::new(MemoryListStore::new());
    let config = SyncConfig {
        retention: 1,
        ..fast_config()
    };
    let start = Instant::now();
    let sync = SyncLoop::new(
        config,
        Arc::new(source),
        store.clone(),
        Arc::new(TokioClock::starting_at(anchor())),
    );
    let handle = tokio::spawn(sync.run());

    sleep(Duration::from_secs(13)).await;

    let calls = calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 2);
    let second = calls[1] - start;
    assert!(
        second >= Duration::from_secs(10) && second <= Duration::from_millis(10_100),
        "second fetch at {second:?}"
    );
    assert_eq!(ids(&store), vec!["b"]);

    handle.abort();
}

#[tokio::test(start_paused = true)]
async fn unchanged_upstream_list_is_never_written_again() {
    let existing = StoredList {
        key: "seed".into(),
        received_at: anchor() - chrono::Duration::minutes(10),
        record: ListRecord::new(
            "a",
            anchor() - chrono::Duration::seconds(1),
            json!({"id": "a"}),
        ),
    };
    let store = Arc::new(MemoryListStore::with_listing(vec![existing]));
    let (source, calls) = scripted_source(vec![Ok(json!({
        "id": "a",
        "validUntil": (anchor() - chrono::Duration::seconds(1)).to_rfc3339()
    }))]);
    let sync = SyncLoop::new(
        fast_config(),
        Arc::new(source),
        store.clone(),
        Arc::new(TokioClock::starting_at(anchor())),
    );
    let status = sync.status();
    let handle = tokio::spawn(sync.run());

    sleep(Duration::from_secs(30)).await;

    assert!(calls.lock().unwrap().len() >= 2, "expired list keeps being rechecked");
    assert_eq!(ids(&store), vec!["a"]);
    assert_eq!(status.borrow().forwarded, 0);

    handle.abort();
}

#[tokio::test(start_paused = true)]
async fn keeps_running_after_fetch_exhaustion() {
    let (source, calls) = scripted_source(vec![
        Err(()),
        Err(()),
        Err(()),
        Ok(upstream("late", chrono::Duration::hours(1))),
    ]);
    let store = Arc::new(MemoryListStore::new());
    let sync = SyncLoop::new(
        fast_config(),
        Arc::new(source),
        store.clone(),
        Arc::new(TokioClock::starting_at(anchor())),
    );
    let handle = tokio::spawn(sync.run());

    // Three failed attempts take 2s + 3s, then the grace delay, then the successful cycle.
    sleep(Duration::from_secs(20)).await;

    assert_eq!(calls.lock().unwrap().len(), 4);
    assert_eq!(ids(&store), vec!["late"]);

    handle.abort();
}

#[tokio::test(start_paused = true)]
async fn list_added_by_someone_else_is_adopted_without_fetching() {
    let (source, calls) = scripted_source(vec![Ok(upstream("a", chrono::Duration::hours(1)))]);
    let store = Arc::new(MemoryListStore::new());
    let sync = SyncLoop::new(
        fast_config(),
        Arc::new(source),
        store.clone(),
        Arc::new(TokioClock::starting_at(anchor())),
    );
    let status = sync.status();
    let handle = tokio::spawn(sync.run());

    sleep(Duration::from_secs(2)).await;
    let fetches = calls.lock().unwrap().len();

    store
        .add(ListRecord::new(
            "external",
            anchor() + chrono::Duration::hours(2),
            json!({}),
        ))
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;

    assert_eq!(status.borrow().latest_id.as_deref(), Some("external"));
    sleep(Duration::from_secs(60 * 60)).await;
    assert_eq!(calls.lock().unwrap().len(), fetches);

    handle.abort();
}

#[tokio::test(start_paused = true)]
async fn malformed_responses_rearm_with_grace_delay() {
    let counter = Arc::new(AtomicUsize::new(0));
    let seen = counter.clone();
    let mut source = MockListSource::new();
    source.expect_fetch_latest().returning(move || {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"no": "id"}))
    });
    let sync = SyncLoop::new(
        fast_config(),
        Arc::new(source),
        Arc::new(MemoryListStore::new()),
        Arc::new(TokioClock::starting_at(anchor())),
    );
    let status = sync.status();
    let handle = tokio::spawn(sync.run());

    sleep(Duration::from_secs(12)).await;

    // Checks at t=0, 5s and 10s.
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    let status = status.borrow().clone();
    assert_eq!(status.state, SyncState::IdleWaiting);
    assert_eq!(status.latest_id, None);
    assert!(status.generation >= 3);

    handle.abort();
}

#[tokio::test(start_paused = true)]
async fn failed_write_is_retried_on_a_later_cycle() {
    let (source, _calls) = scripted_source(vec![Ok(upstream("a", chrono::Duration::hours(1)))]);
    let adds = Arc::new(AtomicUsize::new(0));
    let seen = adds.clone();
    let mut store = MockListStore::new();
    // No notifications ever arrive, so the loop never learns about the write.
    store
        .expect_subscribe()
        .returning(|| Ok(stream::pending().boxed()));
    store.expect_add().returning(move |record| {
        if seen.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(StoreError::Other("disk full".into()))
        } else {
            Ok(StoredList {
                key: "k".into(),
                received_at: anchor(),
                record,
            })
        }
    });
    let sync = SyncLoop::new(
        fast_config(),
        Arc::new(source),
        Arc::new(store),
        Arc::new(TokioClock::starting_at(anchor())),
    );
    let handle = tokio::spawn(sync.run());

    sleep(Duration::from_secs(30)).await;

    assert_eq!(adds.load(Ordering::SeqCst), 2);

    handle.abort();
}

#[tokio::test(start_paused = true)]
async fn cold_start_checks_upstream_even_with_fresh_stored_list() {
    let seeded = StoredList {
        key: "seed".into(),
        received_at: anchor() - chrono::Duration::minutes(1),
        record: ListRecord::new("a", anchor() + chrono::Duration::hours(1), json!({"id": "a"})),
    };
    let store = Arc::new(MemoryListStore::with_listing(vec![seeded]));
    let (source, calls) = scripted_source(vec![Ok(upstream("a", chrono::Duration::hours(1)))]);
    let start = Instant::now();
    let sync = SyncLoop::new(
        SyncConfig::default(),
        Arc::new(source),
        store.clone(),
        Arc::new(TokioClock::starting_at(anchor())),
    );
    let handle = tokio::spawn(sync.run());

    sleep(Duration::from_secs(60)).await;

    let calls = calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0] - start, Duration::ZERO);
    assert_eq!(ids(&store), vec!["a"]);

    handle.abort();
}

#[tokio::test(start_paused = true)]
async fn subscription_failures_are_retried_after_grace_delay() {
    let (source, calls) = scripted_source(vec![Ok(upstream("a", chrono::Duration::hours(1)))]);
    let subscribes = Arc::new(Mutex::new(Vec::new()));
    let seen = subscribes.clone();
    let mut store = MockListStore::new();
    store.expect_subscribe().returning(move || {
        let mut seen = seen.lock().unwrap();
        seen.push(Instant::now());
        match seen.len() {
            1 => Err(StoreError::Other("listener refused".into())),
            // Yields one error, then ends.
            2 => Ok(stream::iter(vec![Err(StoreError::Other("connection reset".into()))]).boxed()),
            _ => Ok(stream::pending().boxed()),
        }
    });
    store.expect_add().returning(|record| {
        Ok(StoredList {
            key: "k".into(),
            received_at: anchor(),
            record,
        })
    });
    let start = Instant::now();
    let sync = SyncLoop::new(
        fast_config(),
        Arc::new(source),
        Arc::new(store),
        Arc::new(TokioClock::starting_at(anchor())),
    );
    let status = sync.status();
    let handle = tokio::spawn(sync.run());

    sleep(Duration::from_secs(12)).await;

    let subscribes: Vec<Duration> = subscribes.lock().unwrap().iter().map(|t| *t - start).collect();
    assert_eq!(
        subscribes,
        vec![Duration::ZERO, Duration::from_secs(5), Duration::from_secs(10)]
    );
    // The schedule kept running throughout.
    assert!(calls.lock().unwrap().len() >= 2);
    assert_eq!(status.borrow().state, SyncState::IdleWaiting);
    assert_eq!(status.borrow().forwarded, 1);

    handle.abort();
}

#[tokio::test(start_paused = true)]
async fn lagged_subscription_is_replaced_with_fresh_snapshot() {
    let (source, _calls) = scripted_source(vec![Ok(upstream("a", chrono::Duration::hours(1)))]);
    let head = StoredList {
        key: "head".into(),
        received_at: anchor(),
        record: ListRecord::new("b", anchor() + chrono::Duration::hours(2), json!({"id": "b"})),
    };
    let subscribes = Arc::new(AtomicUsize::new(0));
    let seen = subscribes.clone();
    let mut store = MockListStore::new();
    store.expect_subscribe().returning(move || {
        if seen.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(stream::iter(vec![Err(StoreError::Lagged(7))])
                .chain(stream::pending())
                .boxed())
        } else {
            let snapshot = ChangeBatch {
                changes: vec![Change {
                    kind: ChangeKind::Added,
                    index: 0,
                    list: head.clone(),
                }],
                listing: vec![head.clone()],
            };
            Ok(stream::iter(vec![Ok(snapshot)]).chain(stream::pending()).boxed())
        }
    });
    store.expect_add().returning(|record| {
        Ok(StoredList {
            key: "k".into(),
            received_at: anchor(),
            record,
        })
    });
    let sync = SyncLoop::new(
        fast_config(),
        Arc::new(source),
        Arc::new(store),
        Arc::new(TokioClock::starting_at(anchor())),
    );
    let status = sync.status();
    let handle = tokio::spawn(sync.run());

    sleep(Duration::from_millis(10)).await;

    assert_eq!(subscribes.load(Ordering::SeqCst), 2);
    assert_eq!(status.borrow().latest_id.as_deref(), Some("b"));

    handle.abort();
}

#[tokio::test(start_paused = true)]
async fn restored_copy_of_latest_becomes_the_protected_head() {
    let (source, _calls) = scripted_source(vec![Ok(upstream("a", chrono::Duration::hours(1)))]);
    let store = Arc::new(MemoryListStore::new());
    let config = SyncConfig {
        retention: 1,
        ..fast_config()
    };
    let sync = SyncLoop::new(
        config,
        Arc::new(source),
        store.clone(),
        Arc::new(TokioClock::starting_at(anchor())),
    );
    let handle = tokio::spawn(sync.run());

    sleep(Duration::from_secs(2)).await;
    assert_eq!(ids(&store), vec!["a"]);

    let copy = store
        .add(ListRecord::new(
            "a",
            anchor() + chrono::Duration::hours(1),
            json!({"id": "a"}),
        ))
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;

    let listing = store.snapshot().unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].key, copy.key);

    handle.abort();
}
