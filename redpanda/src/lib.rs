//! Redpanda event bus implementation for Relay.
//!
//! This crate provides a Redpanda-based event bus that implements the
//! [`EventBus`] trait from `relay-core`. It uses rdkafka, so any
//! Kafka-compatible broker works (Redpanda, Apache Kafka, MSK, ...).
//!
//! # Wire format
//!
//! An outbox row goes out as one record:
//!
//! | Record part | Content |
//! |-------------|---------|
//! | topic       | event type |
//! | key         | aggregate id (per-aggregate ordering) |
//! | headers     | `event_id`, `event_type`, `traceparent`, `tracestate` |
//! | value       | payload bytes, untouched |
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual, ack-driven offset commits:
//! - Each record is handed to the subscriber as a [`Delivery`]; its offset is
//!   committed only after [`Delivery::ack`]
//! - A delivery dropped without ack ends the stream without committing; the
//!   next subscription of the group resumes from the last committed offset
//!   and the record is delivered again
//! - Ordering is guaranteed within a partition (same aggregate id)
//!
//! # Example
//!
//! ```no_run
//! use relay_redpanda::RedpandaEventBus;
//! use relay_core::event_bus::EventBus;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let event_bus = RedpandaEventBus::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("scheduler-service")
//!     .build()?;
//!
//! let mut stream = event_bus.subscribe(&["booking.reminder.requested.v1"]).await?;
//! while let Some(result) = stream.next().await {
//!     let delivery = result?;
//!     println!("Received: {}", delivery.message().topic);
//!     delivery.ack();
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers as _, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use relay_core::event_bus::{DeliveryStream, EventBus, EventBusError};
use relay_core::message::{Delivery, Headers, InboundMessage, OutboundMessage};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::oneshot;

/// Redpanda event bus implementation.
///
/// # Configuration
///
/// - **Broker addresses**: Bootstrap servers (required)
/// - **Producer settings**: Acks, compression, timeout
/// - **Consumer group**: Explicit ID or derived from the topics
/// - **Offset reset**: Where new groups start reading (default: "earliest")
///
/// # Example
///
/// ```no_run
/// use relay_redpanda::RedpandaEventBus;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// // Basic configuration
/// let event_bus = RedpandaEventBus::new("localhost:9092")?;
///
/// // Custom configuration
/// let event_bus = RedpandaEventBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")  // Wait for all replicas
///     .compression("lz4")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaEventBus {
    /// Kafka producer for publishing records
    producer: FutureProducer,
    /// Broker addresses (for creating consumers)
    brokers: String,
    /// Producer timeout
    timeout: Duration,
    /// Consumer group ID (if explicitly set)
    consumer_group: Option<String>,
    /// Auto offset reset policy
    auto_offset_reset: String,
}

impl RedpandaEventBus {
    /// Create a new Redpanda event bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be
    /// created from the broker list.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the event bus.
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Fetch cluster metadata, for readiness checks.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if no broker answers
    /// within the producer timeout.
    pub async fn ping(&self) -> Result<(), EventBusError> {
        let producer = self.producer.clone();
        let timeout = self.timeout;
        let brokers = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, timeout)
                .map(|metadata| metadata.brokers().len())
        })
        .await
        .map_err(|e| EventBusError::ConnectionFailed(format!("Metadata request aborted: {e}")))?
        .map_err(|e| EventBusError::ConnectionFailed(format!("Failed to fetch metadata: {e}")))?;

        if brokers == 0 {
            return Err(EventBusError::ConnectionFailed(
                "Cluster metadata lists no brokers".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for configuring a [`RedpandaEventBus`].
#[derive(Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    auto_offset_reset: Option<String>,
}

impl RedpandaEventBusBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "all"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the consumer group ID for subscriptions.
    ///
    /// Replicas of a service sharing the group split the partitions. If not
    /// set, the group is derived from the subscribed topics.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set where a new consumer group starts reading: "earliest", "latest"
    /// or "error".
    ///
    /// Default: "earliest"
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaEventBus`].
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if brokers are not set or
    /// the producer cannot be created.
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self.brokers.ok_or_else(|| {
            EventBusError::ConnectionFailed("Brokers not configured".to_string())
        })?;
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| {
                EventBusError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaEventBus created"
        );

        Ok(RedpandaEventBus {
            producer,
            brokers,
            timeout,
            consumer_group: self.consumer_group,
            auto_offset_reset,
        })
    }
}

/// Copy message headers into Kafka record headers, in order.
fn to_record_headers(headers: &Headers) -> OwnedHeaders {
    headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(headers.len()), |acc, (key, value)| {
            acc.insert(Header {
                key,
                value: Some(value),
            })
        })
}

/// Convert a consumed record into an [`InboundMessage`].
///
/// Headers without a value are skipped; a missing payload becomes empty.
fn to_inbound<M: Message>(message: &M) -> InboundMessage {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .filter_map(|h| h.value.map(|v| (h.key.to_string(), v.to_vec())))
                .collect()
        })
        .unwrap_or_default();

    InboundMessage {
        topic: message.topic().to_string(),
        key: message.key().map(<[u8]>::to_vec),
        headers,
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        partition: message.partition(),
        offset: message.offset(),
    }
}

fn default_group(topics: &[String]) -> String {
    let mut sorted = topics.to_vec();
    sorted.sort();
    format!("relay-{}", sorted.join("-"))
}

impl EventBus for RedpandaEventBus {
    fn publish<'a>(
        &'a self,
        message: &'a OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + 'a>> {
        Box::pin(async move {
            let record = FutureRecord::to(&message.topic)
                .key(&message.key)
                .payload(&message.payload)
                .headers(to_record_headers(&message.headers));

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %message.topic,
                        partition,
                        offset,
                        "Record published"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %message.topic,
                        error = %kafka_error,
                        "Failed to publish record"
                    );
                    Err(EventBusError::PublishFailed {
                        topic: message.topic.clone(),
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();
        let brokers = self.brokers.clone();
        let consumer_group = self.consumer_group.clone();
        let auto_offset_reset = self.auto_offset_reset.clone();

        Box::pin(async move {
            let group_id = consumer_group.unwrap_or_else(|| default_group(&topics));

            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe to topics: {e}"),
                })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %group_id,
                auto_offset_reset = %auto_offset_reset,
                "Subscribed to topics"
            );

            // One delivery in flight at a time: the next record is fetched
            // only after the previous one was acked.
            let (tx, mut rx) = tokio::sync::mpsc::channel(1);

            tokio::spawn(async move {
                use futures::StreamExt;

                let mut stream = consumer.stream();
                while let Some(next) = stream.next().await {
                    let message = match next {
                        Ok(message) => message,
                        Err(e) => {
                            let err = EventBusError::TransportError(format!(
                                "Failed to receive message: {e}"
                            ));
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                            continue;
                        }
                    };

                    let (ack_tx, ack_rx) = oneshot::channel();
                    if tx
                        .send(Ok(Delivery::new(to_inbound(&message), ack_tx)))
                        .await
                        .is_err()
                    {
                        tracing::debug!("Subscriber dropped, exiting consumer task");
                        break;
                    }

                    if ack_rx.await.is_err() {
                        // Not acked: leave the offset uncommitted so the
                        // group redelivers from here.
                        tracing::debug!(
                            topic = message.topic(),
                            partition = message.partition(),
                            offset = message.offset(),
                            "Delivery not acknowledged, ending subscription"
                        );
                        break;
                    }

                    if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                        tracing::warn!(
                            topic = message.topic(),
                            partition = message.partition(),
                            offset = message.offset(),
                            error = %e,
                            "Failed to commit offset (message may be redelivered)"
                        );
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

            let stream = async_stream::stream! {
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use rdkafka::message::{Headers as _, OwnedMessage, Timestamp};
    use relay_core::message::{EVENT_ID_HEADER, EventMeta};

    #[test]
    fn redpanda_event_bus_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaEventBus>();
        assert_sync::<RedpandaEventBus>();
    }

    #[tokio::test]
    async fn ping_fails_when_no_broker_answers() {
        let bus = RedpandaEventBus::builder()
            .brokers("127.0.0.1:1")
            .timeout(Duration::from_millis(300))
            .build()
            .unwrap();

        assert!(matches!(
            bus.ping().await,
            Err(EventBusError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn build_requires_brokers() {
        assert!(matches!(
            RedpandaEventBus::builder().build(),
            Err(EventBusError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn record_headers_keep_order_and_values() {
        let mut headers = Headers::new();
        headers.insert(EVENT_ID_HEADER, "E1");
        headers.insert("traceparent", "00-abc-def-01");

        let record = to_record_headers(&headers);
        assert_eq!(record.count(), 2);
        let first = record.get(0);
        assert_eq!(first.key, EVENT_ID_HEADER);
        assert_eq!(first.value, Some(b"E1".as_slice()));
    }

    #[test]
    fn consumed_record_becomes_inbound_message() {
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: EVENT_ID_HEADER,
                value: Some("E1"),
            })
            .insert(Header {
                key: "empty",
                value: None::<&str>,
            });
        let record = OwnedMessage::new(
            Some(b"{}".to_vec()),
            Some(b"A1".to_vec()),
            "booking.appointment.booked.v1".to_string(),
            Timestamp::NotAvailable,
            3,
            42,
            Some(headers),
        );

        let inbound = to_inbound(&record);
        assert_eq!(inbound.partition, 3);
        assert_eq!(inbound.offset, 42);
        assert_eq!(inbound.key.as_deref(), Some(b"A1".as_slice()));
        assert_eq!(inbound.headers.len(), 1);

        let meta = EventMeta::from_message(&inbound);
        assert_eq!(meta.event_id, "E1");
        assert_eq!(meta.event_type, "booking.appointment.booked.v1");
    }

    #[test]
    fn missing_payload_is_empty() {
        let record = OwnedMessage::new(
            None,
            None,
            "t".to_string(),
            Timestamp::NotAvailable,
            0,
            7,
            None,
        );
        let inbound = to_inbound(&record);
        assert!(inbound.payload.is_empty());
        assert!(inbound.key.is_none());
        assert!(inbound.headers.is_empty());
        assert_eq!(EventMeta::from_message(&inbound).event_id, "t/0/7");
    }

    #[test]
    fn default_group_is_stable_across_topic_order() {
        let a = default_group(&["b".to_string(), "a".to_string()]);
        let b = default_group(&["a".to_string(), "b".to_string()]);
        assert_eq!(a, b);
        assert_eq!(a, "relay-a-b");
    }
}
