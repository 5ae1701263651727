//! Message bus abstraction used by the outbox publisher and the event consumer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐        ┌──────────────┐        ┌──────────────────┐
//! │ Outbox publisher │ ─────► │  Event bus   │ ─────► │  Event consumer  │
//! │ (outbox rows)    │ publish│ (Redpanda)   │ stream │ (inbox + handler)│
//! └──────────────────┘        └──────────────┘        └──────────────────┘
//! ```
//!
//! # Key Principles
//!
//! - **At-least-once delivery**: a message may be delivered more than once
//! - **Ordered within partition**: messages with the same key keep their order
//! - **Explicit acknowledgement**: a subscriber acks each [`Delivery`] once it
//!   is durably handled; an unacknowledged delivery is redelivered
//!
//! # Implementations
//!
//! - `InMemoryEventBus` in `relay-testing`, for tests
//! - `RedpandaEventBus` in `relay-redpanda`, for production (Kafka-compatible)

use crate::message::{Delivery, OutboundMessage};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the event bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Stream of deliveries from a subscription.
///
/// The stream ends when the underlying consumer stops, for example after a
/// delivery was dropped without acknowledgement. Callers resubscribe to
/// resume from the last committed position.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, EventBusError>> + Send>>;

/// Publish/subscribe transport.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so it can be held as `Arc<dyn EventBus>` by long-running workers.
pub trait EventBus: Send + Sync {
    /// Publish a message and wait for the broker to accept it.
    ///
    /// Returning `Ok` means the broker has the message; the caller may then
    /// record it as published.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the broker rejects the
    /// message or does not answer in time.
    fn publish<'a>(
        &'a self,
        message: &'a OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + 'a>>;

    /// Subscribe to one or more topics.
    ///
    /// Implementations use consumer groups, so several instances of the same
    /// service share partitions. Delivery order follows partition order and a
    /// partition does not advance past an unacknowledged delivery.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventBusError>> + Send + '_>>;
}
