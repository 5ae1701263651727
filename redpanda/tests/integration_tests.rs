//! Integration tests for [`RedpandaEventBus`] against a real Kafka broker.
//!
//! These tests use testcontainers and validate:
//! - Headers, key and payload survive the round trip
//! - An acked delivery is committed and not seen again by the group
//! - A dropped delivery is redelivered on the next subscription
//!
//! They are `#[ignore]` by default because they need Docker and take a while
//! to start the broker. To run explicitly:
//! ```bash
//! cargo test -p relay-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used, clippy::unwrap_used)]

use futures::StreamExt;
use relay_core::event_bus::{DeliveryStream, EventBus};
use relay_core::message::{
    Delivery, EVENT_ID_HEADER, EVENT_TYPE_HEADER, EventMeta, Headers, OutboundMessage,
};
use relay_redpanda::RedpandaEventBus;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

fn outbound(topic: &str, event_id: &str, aggregate_id: &str, payload: &[u8]) -> OutboundMessage {
    let mut headers = Headers::new();
    headers.insert(EVENT_ID_HEADER, event_id);
    headers.insert(EVENT_TYPE_HEADER, topic);
    headers.insert("traceparent", "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01");
    OutboundMessage {
        topic: topic.to_string(),
        key: aggregate_id.as_bytes().to_vec(),
        headers,
        payload: payload.to_vec(),
    }
}

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    (kafka, format!("{host}:{port}"))
}

/// Publish a warmup record until the broker accepts it, creating the topic.
async fn ensure_topic_exists(bus: &RedpandaEventBus, topic: &str) {
    let warmup = outbound(topic, "warmup", "warmup", b"warmup");
    for attempt in 1..=60 {
        if bus.publish(&warmup).await.is_ok() {
            tokio::time::sleep(Duration::from_secs(2)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(attempt != 60, "Failed to create topic {topic}");
    }
}

/// Next delivery that is not a warmup record. Warmup records are acked.
async fn next_real(stream: &mut DeliveryStream) -> Delivery {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let delivery = stream
                .next()
                .await
                .expect("stream ended")
                .expect("delivery failed");
            if EventMeta::from_message(delivery.message()).event_id == "warmup" {
                delivery.ack();
                continue;
            }
            return delivery;
        }
    })
    .await
    .expect("Timeout waiting for delivery")
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn ping_reaches_a_running_broker() {
    let (_kafka, brokers) = start_kafka().await;
    let bus = RedpandaEventBus::new(&brokers).expect("Failed to create event bus");
    bus.ping().await.expect("broker answers metadata request");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn headers_key_and_payload_round_trip() {
    let (_kafka, brokers) = start_kafka().await;
    let topic = "booking.appointment.booked.v1";

    let bus = RedpandaEventBus::builder()
        .brokers(&brokers)
        .consumer_group("round-trip")
        .build()
        .expect("Failed to create event bus");
    ensure_topic_exists(&bus, topic).await;

    let mut stream = bus.subscribe(&[topic]).await.expect("Failed to subscribe");
    bus.publish(&outbound(topic, "E1", "A1", br#"{"appointment_id":"A1"}"#))
        .await
        .expect("Failed to publish");

    let delivery = next_real(&mut stream).await;
    let message = delivery.message();
    assert_eq!(message.topic, topic);
    assert_eq!(message.key.as_deref(), Some(b"A1".as_slice()));
    assert_eq!(message.payload, br#"{"appointment_id":"A1"}"#.to_vec());
    assert_eq!(
        message.headers.get_str("traceparent"),
        Some("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
    );

    let meta = EventMeta::from_message(message);
    assert_eq!(meta.event_id, "E1");
    assert_eq!(meta.event_type, topic);
    delivery.ack();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn unacked_delivery_is_redelivered_to_the_group() {
    let (_kafka, brokers) = start_kafka().await;
    let topic = "scheduler.reminder.due.v1";

    let bus = RedpandaEventBus::builder()
        .brokers(&brokers)
        .consumer_group("redelivery")
        .build()
        .expect("Failed to create event bus");
    ensure_topic_exists(&bus, topic).await;

    bus.publish(&outbound(topic, "E1", "A1", b"first"))
        .await
        .expect("Failed to publish");
    bus.publish(&outbound(topic, "E2", "A1", b"second"))
        .await
        .expect("Failed to publish");

    // First subscription acks E1 and drops E2.
    let mut stream = bus.subscribe(&[topic]).await.expect("Failed to subscribe");
    let first = next_real(&mut stream).await;
    assert_eq!(EventMeta::from_message(first.message()).event_id, "E1");
    first.ack();
    let second = next_real(&mut stream).await;
    assert_eq!(EventMeta::from_message(second.message()).event_id, "E2");
    drop(second);
    drop(stream);

    // Give the async commit and group leave time to settle.
    tokio::time::sleep(Duration::from_secs(3)).await;

    let mut stream = bus.subscribe(&[topic]).await.expect("Failed to resubscribe");
    let again = next_real(&mut stream).await;
    assert_eq!(EventMeta::from_message(again.message()).event_id, "E2");
    again.ack();
}
