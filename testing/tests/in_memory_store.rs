//! Behaviour of the in-memory store that the runtime tests rely on.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use chrono::TimeDelta;
use relay_core::environment::Clock;
use relay_core::idempotency::{IdempotencyStore, LockedKey, StoredResponse};
use relay_core::inbox::InboxStore;
use relay_core::jobs::{JobStore, NewScheduledJob};
use relay_core::outbox::{NewOutboxEvent, OutboxStore};
use relay_core::store::{Admission, StoreError, Transactional};
use relay_testing::{Fault, InMemoryStore, test_clock};
use std::sync::Arc;
use tokio_test::{assert_pending, assert_ready};

fn event(aggregate_id: &str) -> NewOutboxEvent {
    NewOutboxEvent::new(
        "appointment",
        aggregate_id,
        "booking.appointment.booked.v1",
        b"{}".to_vec(),
    )
}

#[tokio::test]
async fn uncommitted_writes_are_invisible_and_dropped_on_rollback() {
    let store = InMemoryStore::new();

    let mut tx = store.begin().await.unwrap();
    store.insert_event(&mut tx, &event("A1")).await.unwrap();
    assert!(store.outbox().is_empty());
    drop(tx);

    assert!(store.outbox().is_empty());
}

#[tokio::test]
async fn claimed_rows_are_skipped_until_the_claim_ends() {
    let store = InMemoryStore::new();
    let mut tx = store.begin().await.unwrap();
    for id in ["A1", "A2", "A3"] {
        store.insert_event(&mut tx, &event(id)).await.unwrap();
    }
    store.commit(tx).await.unwrap();

    let mut first = store.begin().await.unwrap();
    let batch = store.acquire_batch(&mut first, 2).await.unwrap();
    assert_eq!(
        batch.iter().map(|r| r.aggregate_id.as_str()).collect::<Vec<_>>(),
        vec!["A1", "A2"]
    );

    let mut second = store.begin().await.unwrap();
    let rest = store.acquire_batch(&mut second, 10).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].aggregate_id, "A3");

    drop(first);
    let mut third = store.begin().await.unwrap();
    assert_eq!(store.acquire_batch(&mut third, 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn published_at_is_never_overwritten() {
    let clock = test_clock();
    let store = InMemoryStore::new();
    let mut tx = store.begin().await.unwrap();
    let (id, _) = store
        .insert_event(&mut tx, &event("A1"))
        .await
        .unwrap()
        .admitted()
        .unwrap();
    store.mark_published(&mut tx, &[id], clock.now()).await.unwrap();
    store
        .mark_published(&mut tx, &[id], clock.now() + TimeDelta::hours(1))
        .await
        .unwrap();
    store.commit(tx).await.unwrap();

    assert_eq!(store.outbox()[0].published_at, Some(clock.now()));
}

#[tokio::test]
async fn dedup_key_admits_once() {
    let store = InMemoryStore::new();
    let mut tx = store.begin().await.unwrap();
    let first = store
        .insert_event(&mut tx, &event("A1").with_dedup_key("k"))
        .await
        .unwrap();
    let second = store
        .insert_event(&mut tx, &event("A1").with_dedup_key("k"))
        .await
        .unwrap();
    store.commit(tx).await.unwrap();

    assert!(first.is_admitted());
    assert_eq!(second, Admission::Duplicate);
    assert_eq!(store.outbox().len(), 1);
}

#[tokio::test]
async fn inbox_conflict_is_a_duplicate_not_an_error() {
    let store = InMemoryStore::new();
    let mut tx = store.begin().await.unwrap();
    assert!(store.record(&mut tx, "evt-1", "t").await.unwrap().is_admitted());
    store.commit(tx).await.unwrap();

    let mut tx = store.begin().await.unwrap();
    assert!(store.record(&mut tx, "evt-1", "t").await.unwrap().is_duplicate());
    assert_eq!(store.inbox().len(), 1);
}

#[tokio::test]
async fn second_lock_on_a_key_waits_for_the_first_transaction() {
    let store = InMemoryStore::new();

    let mut first = store.begin().await.unwrap();
    let locked = store.lock_key(&mut first, "biz", "K1").await.unwrap();
    assert!(matches!(locked, LockedKey::Reserved(_)));

    let waiter_store = store.clone();
    let mut second = store.begin().await.unwrap();
    let mut waiting = tokio_test::task::spawn(async move {
        waiter_store.lock_key(&mut second, "biz", "K1").await
    });
    assert_pending!(waiting.poll());

    let response = StoredResponse::new(201, br#"{"id":"X"}"#.to_vec()).with_resource_id("X");
    store
        .finalize_key(&mut first, "biz", "K1", &response)
        .await
        .unwrap();
    store.commit(first).await.unwrap();

    assert!(waiting.is_woken());
    let observed = assert_ready!(waiting.poll()).unwrap();
    assert_eq!(observed.replay(), Some(response));
}

#[tokio::test]
async fn key_locks_are_forgotten_once_released() {
    let store = InMemoryStore::new();

    let mut finalized = store.begin().await.unwrap();
    store.lock_key(&mut finalized, "biz", "K1").await.unwrap();
    store
        .finalize_key(&mut finalized, "biz", "K1", &StoredResponse::new(201, Vec::new()))
        .await
        .unwrap();
    let mut abandoned = store.begin().await.unwrap();
    store.lock_key(&mut abandoned, "biz", "K2").await.unwrap();
    assert_eq!(store.tracked_key_locks(), 2);

    store.commit(finalized).await.unwrap();
    store.rollback(abandoned).await.unwrap();
    assert_eq!(store.tracked_key_locks(), 0);
}

#[tokio::test]
async fn key_lock_survives_while_another_transaction_waits() {
    let store = InMemoryStore::new();

    let mut first = store.begin().await.unwrap();
    store.lock_key(&mut first, "biz", "K1").await.unwrap();

    let waiter_store = store.clone();
    let mut second = store.begin().await.unwrap();
    let mut waiting = tokio_test::task::spawn(async move {
        let locked = waiter_store.lock_key(&mut second, "biz", "K1").await;
        (locked, second)
    });
    assert_pending!(waiting.poll());

    store.rollback(first).await.unwrap();
    assert_eq!(store.tracked_key_locks(), 1);

    let (locked, second) = assert_ready!(waiting.poll());
    assert!(matches!(locked.unwrap(), LockedKey::Reserved(_)));
    assert_eq!(store.tracked_key_locks(), 1);

    drop(second);
    assert_eq!(store.tracked_key_locks(), 0);
}

#[tokio::test]
async fn finalize_requires_a_reservation() {
    let store = InMemoryStore::new();
    let mut tx = store.begin().await.unwrap();
    let result = store
        .finalize_key(&mut tx, "biz", "missing", &StoredResponse::new(200, Vec::new()))
        .await;
    assert!(matches!(result, Err(StoreError::InvalidData(_))));
}

#[tokio::test]
async fn savepoint_rollback_discards_only_later_writes() {
    let store = InMemoryStore::new();
    let mut tx = store.begin().await.unwrap();
    store.insert_event(&mut tx, &event("kept")).await.unwrap();

    store.savepoint(&mut tx, "step").await.unwrap();
    store.insert_event(&mut tx, &event("discarded")).await.unwrap();
    store.rollback_to_savepoint(&mut tx, "step").await.unwrap();
    store.release_savepoint(&mut tx, "step").await.unwrap();
    store.commit(tx).await.unwrap();

    let rows = store.outbox();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].aggregate_id, "kept");
}

#[tokio::test]
async fn unknown_savepoint_is_an_error() {
    let store = InMemoryStore::new();
    let mut tx = store.begin().await.unwrap();
    assert!(store.rollback_to_savepoint(&mut tx, "nope").await.is_err());
}

#[tokio::test]
async fn fetch_due_orders_by_next_run_at_and_skips_future_jobs() {
    let clock = test_clock();
    let store = InMemoryStore::with_clock(Arc::new(clock.clone()));
    let now = clock.now();

    let mut tx = store.begin().await.unwrap();
    for (key, offset) in [("late", 10), ("early", -10), ("future", 3600)] {
        let job = NewScheduledJob::new(
            key,
            serde_json::json!({}),
            now + TimeDelta::seconds(offset),
            3,
        );
        store.insert_job(&mut tx, &job).await.unwrap();
    }
    let duplicate = NewScheduledJob::new("early", serde_json::json!({}), now, 3);
    assert!(store.insert_job(&mut tx, &duplicate).await.unwrap().is_duplicate());
    store.commit(tx).await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let due = store
        .fetch_due(&mut tx, now + TimeDelta::seconds(60), 10)
        .await
        .unwrap();
    let keys: Vec<_> = due.iter().map(|j| j.idempotency_key.as_str()).collect();
    assert_eq!(keys, vec!["early", "late"]);
}

#[tokio::test]
async fn injected_commit_fault_rolls_back() {
    let store = InMemoryStore::new();
    store.inject_fault(Fault::Commit, 1);

    let mut tx = store.begin().await.unwrap();
    store.insert_event(&mut tx, &event("A1")).await.unwrap();
    assert!(matches!(
        store.commit(tx).await,
        Err(StoreError::FaultInjected(_))
    ));
    assert!(store.outbox().is_empty());

    let mut tx = store.begin().await.unwrap();
    store.insert_event(&mut tx, &event("A1")).await.unwrap();
    store.commit(tx).await.unwrap();
    assert_eq!(store.outbox().len(), 1);
}

#[tokio::test]
async fn domain_records_commit_with_the_transaction() {
    let store = InMemoryStore::new();
    let mut tx = store.begin().await.unwrap();
    store.put_record(&mut tx, "appointments", "X", serde_json::json!({"id": "X"}));
    store.rollback(tx).await.unwrap();
    assert!(store.records("appointments").is_empty());

    let mut tx = store.begin().await.unwrap();
    store.put_record(&mut tx, "appointments", "X", serde_json::json!({"id": "X"}));
    store.commit(tx).await.unwrap();
    assert_eq!(store.records("appointments").len(), 1);
}
