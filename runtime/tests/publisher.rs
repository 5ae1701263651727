//! Outbox publisher behavior against the in-memory store and bus.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use proptest::prelude::*;
use relay_core::message::{EVENT_ID_HEADER, EVENT_TYPE_HEADER};
use relay_core::outbox::{NewOutboxEvent, OutboxStore};
use relay_core::store::Transactional;
use relay_core::trace_context::{TRACEPARENT_HEADER, TraceContext};
use relay_runtime::publisher::{OutboxPublisher, PublishError, PublisherConfig};
use relay_testing::properties::eventually_succeeds;
use relay_testing::{Fault, InMemoryEventBus, InMemoryStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const BOOKED: &str = "booking.appointment.booked.v1";
const TRACEPARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

async fn commit_event(store: &InMemoryStore, aggregate_id: &str) {
    let mut tx = store.begin().await.unwrap();
    let event = NewOutboxEvent::new("appointment", aggregate_id, BOOKED, br#"{"ok":true}"#.to_vec())
        .with_trace(TraceContext::new(TRACEPARENT, ""));
    store.insert_event(&mut tx, &event).await.unwrap();
    store.commit(tx).await.unwrap();
}

fn publisher(store: &InMemoryStore, bus: &InMemoryEventBus) -> OutboxPublisher<InMemoryStore> {
    OutboxPublisher::new(Arc::new(store.clone()), Some(Arc::new(bus.clone())))
}

#[tokio::test]
async fn failed_publish_leaves_event_for_the_next_tick() {
    let store = InMemoryStore::new();
    let bus = InMemoryEventBus::new();
    let publisher = publisher(&store, &bus);
    commit_event(&store, "A1").await;

    bus.fail_next_publishes(1);
    let result = publisher.publish_batch().await;
    assert!(matches!(result, Err(PublishError::Bus { .. })));
    assert_eq!(store.unpublished().len(), 1);
    assert!(bus.published().is_empty());

    assert_eq!(publisher.publish_batch().await.unwrap(), 1);
    assert!(store.unpublished().is_empty());

    let record = &store.outbox()[0];
    let published = bus.published_to(BOOKED);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].key, b"A1".to_vec());
    assert_eq!(
        published[0].headers.get_str(EVENT_ID_HEADER),
        Some(record.event_id.to_string().as_str())
    );
    assert_eq!(published[0].headers.get_str(EVENT_TYPE_HEADER), Some(BOOKED));
    assert_eq!(published[0].headers.get_str(TRACEPARENT_HEADER), Some(TRACEPARENT));
}

#[tokio::test]
async fn rolled_back_events_are_never_published() {
    let store = InMemoryStore::new();
    let bus = InMemoryEventBus::new();

    let mut tx = store.begin().await.unwrap();
    let event = NewOutboxEvent::new("appointment", "A1", BOOKED, b"{}".to_vec());
    store.insert_event(&mut tx, &event).await.unwrap();
    store.rollback(tx).await.unwrap();

    assert_eq!(publisher(&store, &bus).publish_batch().await.unwrap(), 0);
    assert!(bus.published().is_empty());
}

#[tokio::test]
async fn batches_follow_insertion_order_and_size() {
    let store = InMemoryStore::new();
    let bus = InMemoryEventBus::new();
    for id in ["A1", "A2", "A3"] {
        commit_event(&store, id).await;
    }

    let publisher = publisher(&store, &bus).with_config(PublisherConfig::default().with_batch_size(2));
    assert_eq!(publisher.publish_batch().await.unwrap(), 2);
    assert_eq!(publisher.publish_batch().await.unwrap(), 1);
    assert_eq!(publisher.publish_batch().await.unwrap(), 0);

    let keys: Vec<Vec<u8>> = bus.published().into_iter().map(|m| m.key).collect();
    assert_eq!(keys, vec![b"A1".to_vec(), b"A2".to_vec(), b"A3".to_vec()]);
}

#[tokio::test]
async fn rows_claimed_by_another_replica_are_skipped() {
    let store = InMemoryStore::new();
    let bus = InMemoryEventBus::new();
    commit_event(&store, "A1").await;

    let mut other = store.begin().await.unwrap();
    let claimed = store.acquire_batch(&mut other, 10).await.unwrap();
    assert_eq!(claimed.len(), 1);

    let publisher = publisher(&store, &bus);
    assert_eq!(publisher.publish_batch().await.unwrap(), 0);

    store.rollback(other).await.unwrap();
    assert_eq!(publisher.publish_batch().await.unwrap(), 1);
}

#[tokio::test]
async fn mark_failure_republishes_the_whole_batch() {
    let store = InMemoryStore::new();
    let bus = InMemoryEventBus::new();
    commit_event(&store, "A1").await;
    commit_event(&store, "A2").await;

    store.inject_fault(Fault::MarkPublished, 1);
    let publisher = publisher(&store, &bus);
    assert!(matches!(publisher.publish_batch().await, Err(PublishError::Store(_))));
    assert_eq!(store.unpublished().len(), 2);

    assert_eq!(publisher.publish_batch().await.unwrap(), 2);
    // At-least-once: the first attempt already reached the bus.
    assert_eq!(bus.published().len(), 4);
    assert!(store.unpublished().is_empty());
}

#[tokio::test]
async fn publisher_without_bus_is_disabled() {
    let store = InMemoryStore::new();
    commit_event(&store, "A1").await;

    let publisher = OutboxPublisher::new(Arc::new(store.clone()), None);
    assert!(matches!(publisher.publish_batch().await, Err(PublishError::Disabled)));

    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::time::timeout(Duration::from_secs(1), publisher.run(shutdown_rx))
        .await
        .expect("disabled publisher returns immediately");
    assert_eq!(store.unpublished().len(), 1);
}

#[tokio::test]
async fn shutdown_interrupts_a_hanging_batch() {
    relay_testing::init_tracing();
    let store = InMemoryStore::new();
    let bus = InMemoryEventBus::new();
    commit_event(&store, "A1").await;

    bus.hang_publishes(true);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = publisher(&store, &bus)
        .with_config(PublisherConfig::default().with_poll_interval(Duration::from_millis(10)))
        .spawn(shutdown_rx);

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("publisher stops on shutdown")
        .unwrap();

    assert_eq!(store.unpublished().len(), 1);

    bus.hang_publishes(false);
    assert_eq!(publisher(&store, &bus).publish_batch().await.unwrap(), 1);
}

#[tokio::test]
async fn running_publisher_drains_the_outbox() {
    let store = InMemoryStore::new();
    let bus = InMemoryEventBus::new();
    commit_event(&store, "A1").await;
    bus.fail_next_publishes(2);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = publisher(&store, &bus)
        .with_config(PublisherConfig::default().with_poll_interval(Duration::from_millis(5)))
        .spawn(shutdown_rx);

    tokio::time::timeout(Duration::from_secs(2), async {
        while !store.unpublished().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("outbox drained");

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();
    assert_eq!(bus.published().len(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn every_committed_event_is_eventually_published(
        events in 1usize..5,
        schedule in eventually_succeeds(6),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let store = InMemoryStore::new();
            let bus = InMemoryEventBus::new();
            for i in 0..events {
                commit_event(&store, &format!("A{i}")).await;
            }

            let publisher = publisher(&store, &bus);
            for fail in &schedule {
                if *fail {
                    bus.fail_next_publishes(1);
                }
                let _ = publisher.publish_batch().await;
            }

            prop_assert!(store.unpublished().is_empty());
            for record in store.outbox() {
                let event_id = record.event_id.to_string();
                let copies = bus
                    .published()
                    .iter()
                    .filter(|m| m.headers.get_str(EVENT_ID_HEADER) == Some(event_id.as_str()))
                    .count();
                prop_assert!(copies >= 1);
            }
            Ok(())
        })?;
    }
}
