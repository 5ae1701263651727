//! In-memory event bus.
//!
//! Published messages are recorded for assertions and queued per topic for
//! subscribers. Subscribers of the same topic share its queue, like members of
//! one consumer group. A delivery dropped without acknowledgement goes back to
//! the front of its queue and is delivered again.

#![allow(clippy::missing_panics_doc)] // Poisoned locks are recovered, nothing panics

use futures::StreamExt;
use relay_core::event_bus::{DeliveryStream, EventBus, EventBusError};
use relay_core::message::{Delivery, InboundMessage, OutboundMessage};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, oneshot};

#[derive(Default)]
struct Inner {
    published: Mutex<Vec<OutboundMessage>>,
    acked: Mutex<Vec<InboundMessage>>,
    queues: Mutex<HashMap<String, VecDeque<InboundMessage>>>,
    publish_failures: Mutex<u32>,
    receive_failures: Mutex<u32>,
    hang_publishes: AtomicBool,
    next_offset: AtomicI64,
    notify: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn take_one(counter: &Mutex<u32>) -> bool {
    let mut remaining = lock(counter);
    if *remaining > 0 {
        *remaining -= 1;
        true
    } else {
        false
    }
}

impl Inner {
    fn enqueue(&self, message: InboundMessage) {
        lock(&self.queues)
            .entry(message.topic.clone())
            .or_default()
            .push_back(message);
        self.notify.notify_waiters();
    }

    fn requeue(&self, message: InboundMessage) {
        lock(&self.queues)
            .entry(message.topic.clone())
            .or_default()
            .push_front(message);
        self.notify.notify_waiters();
    }

    fn take_receive_failure(&self) -> bool {
        take_one(&self.receive_failures)
    }

    fn pop(&self, topics: &[String]) -> Option<InboundMessage> {
        let mut queues = lock(&self.queues);
        topics
            .iter()
            .find_map(|topic| queues.get_mut(topic).and_then(VecDeque::pop_front))
    }
}

/// A delivered message that goes back to its queue unless acknowledged.
struct InFlight {
    inner: Arc<Inner>,
    message: Option<InboundMessage>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            self.inner.requeue(message);
        }
    }
}

/// In-memory [`EventBus`] for tests.
///
/// Cloning shares the underlying queues.
///
/// # Example
///
/// ```
/// use relay_core::event_bus::EventBus;
/// use relay_core::message::{Headers, OutboundMessage};
/// use relay_testing::InMemoryEventBus;
///
/// # async fn example() -> Result<(), relay_core::EventBusError> {
/// let bus = InMemoryEventBus::new();
/// bus.fail_next_publishes(1);
///
/// let message = OutboundMessage {
///     topic: "booking.appointment.booked.v1".to_string(),
///     key: b"A1".to_vec(),
///     headers: Headers::new(),
///     payload: b"{}".to_vec(),
/// };
/// assert!(bus.publish(&message).await.is_err());
/// bus.publish(&message).await?;
/// assert_eq!(bus.published().len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for InMemoryEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventBus")
            .field("published", &lock(&self.inner.published).len())
            .finish_non_exhaustive()
    }
}

impl InMemoryEventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` publishes fail.
    pub fn fail_next_publishes(&self, times: u32) {
        *lock(&self.inner.publish_failures) += times;
    }

    /// Make subscription streams yield `times` transport errors before their
    /// next delivery.
    pub fn fail_next_receives(&self, times: u32) {
        *lock(&self.inner.receive_failures) += times;
    }

    /// While set, publishes never complete.
    pub fn hang_publishes(&self, hang: bool) {
        self.inner.hang_publishes.store(hang, Ordering::SeqCst);
    }

    /// Queue a message for subscribers, as if an external producer sent it.
    pub fn deliver(&self, message: InboundMessage) {
        self.inner.enqueue(message);
    }

    /// Queue every message published so far for delivery again.
    pub fn redeliver_published(&self) {
        for message in self.published() {
            self.inner.enqueue(self.to_inbound(&message));
        }
    }

    /// Messages accepted by [`EventBus::publish`], in order.
    #[must_use]
    pub fn published(&self) -> Vec<OutboundMessage> {
        lock(&self.inner.published).clone()
    }

    /// Accepted messages of one topic.
    #[must_use]
    pub fn published_to(&self, topic: &str) -> Vec<OutboundMessage> {
        lock(&self.inner.published)
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Deliveries acknowledged by subscribers, in order.
    #[must_use]
    pub fn acked(&self) -> Vec<InboundMessage> {
        lock(&self.inner.acked).clone()
    }

    /// Messages waiting for a subscriber on `topic`.
    #[must_use]
    pub fn pending(&self, topic: &str) -> usize {
        lock(&self.inner.queues).get(topic).map_or(0, VecDeque::len)
    }

    fn to_inbound(&self, message: &OutboundMessage) -> InboundMessage {
        let offset = self.inner.next_offset.fetch_add(1, Ordering::SeqCst);
        InboundMessage::from_outbound(message, 0, offset)
    }

    fn take_publish_failure(&self) -> bool {
        take_one(&self.inner.publish_failures)
    }
}

impl EventBus for InMemoryEventBus {
    fn publish<'a>(
        &'a self,
        message: &'a OutboundMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + 'a>> {
        Box::pin(async move {
            if self.inner.hang_publishes.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.take_publish_failure() {
                return Err(EventBusError::PublishFailed {
                    topic: message.topic.clone(),
                    reason: "injected failure".to_string(),
                });
            }
            lock(&self.inner.published).push(message.clone());
            self.inner.enqueue(self.to_inbound(message));
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|t| (*t).to_string()).collect();
        let inner = Arc::clone(&self.inner);

        Box::pin(async move {
            let stream = async_stream::stream! {
                loop {
                    if inner.take_receive_failure() {
                        yield Err(EventBusError::TransportError(
                            "injected receive failure".to_string(),
                        ));
                        continue;
                    }

                    let message = loop {
                        let notified = inner.notify.notified();
                        tokio::pin!(notified);
                        notified.as_mut().enable();
                        if let Some(message) = inner.pop(&topics) {
                            break message;
                        }
                        notified.await;
                    };

                    let mut in_flight = InFlight {
                        inner: Arc::clone(&inner),
                        message: Some(message.clone()),
                    };
                    let (ack_tx, ack_rx) = oneshot::channel();
                    yield Ok(Delivery::new(message, ack_tx));

                    if ack_rx.await.is_ok() {
                        if let Some(message) = in_flight.message.take() {
                            lock(&inner.acked).push(message);
                        }
                    }
                }
            };
            Ok(stream.boxed())
        })
    }
}
