//! Event consumer with inbox deduplication and automatic reconnection.
//!
//! # Pattern: Subscribe-Dedup-Handle Loop
//!
//! ```text
//! loop {
//!     subscribe(topics)
//!     for item in stream {
//!         receive error: wait retry_delay, continue
//!         begin
//!         inbox.record(event_id)  -- duplicate: rollback, ack, skip
//!         handler.handle(tx, message)
//!             ok:  commit, ack
//!             err: rollback, leave unacked, wait retry_delay
//!     }
//!     stream ended: wait retry_delay, resubscribe
//! }
//! ```
//!
//! The inbox entry and the handler's writes share one transaction, so an
//! event either has both its effects and its inbox entry, or neither. A crash
//! at any point leads to redelivery, and redelivery of a handled event is
//! skipped.

use crate::metrics::ConsumerMetrics;
use futures::StreamExt;
use relay_core::event_bus::{DeliveryStream, EventBus};
use relay_core::inbox::{HandlerError, InboxStore, MessageHandler};
use relay_core::message::{EventMeta, InboundMessage};
use relay_core::store::StoreError;
use relay_core::trace_context::TraceContext;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Errors from handling one delivery. The delivery stays unacknowledged.
#[derive(Error, Debug)]
pub enum ConsumeError {
    /// The inbox store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The handler asked for redelivery.
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),
}

/// What happened to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// The handler ran and its effects were committed with the inbox entry.
    Processed,
    /// The event was already in the inbox; the handler did not run.
    Duplicate,
}

/// Event bus consumer.
///
/// # Lifecycle
///
/// 1. Created via `new()`
/// 2. Spawned as background task via `spawn()`
/// 3. Runs until the shutdown signal
///
/// # Configuration
///
/// - `name`: Human-readable consumer name (for logging)
/// - `topics`: List of event bus topics to subscribe to
/// - `retry_delay`: How long to wait after a failure (default: 5s)
pub struct EventConsumer<S, H> {
    /// Consumer name (for logging and monitoring)
    name: String,

    /// Topics to subscribe to
    topics: Vec<String>,

    /// Event bus to consume from
    event_bus: Arc<dyn EventBus>,

    /// Store holding the inbox and the handler's tables
    store: Arc<S>,

    /// Handler for processing events
    handler: Arc<H>,

    /// Shutdown signal receiver
    shutdown: broadcast::Receiver<()>,

    /// Delay after a failed delivery or a lost stream
    retry_delay: Duration,
}

impl<S, H> EventConsumer<S, H>
where
    S: InboxStore + 'static,
    S::Tx: 'static,
    H: MessageHandler<S> + 'static,
{
    /// Create a new event consumer with a 5 second retry delay.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        topics: Vec<String>,
        event_bus: Arc<dyn EventBus>,
        store: Arc<S>,
        handler: Arc<H>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            name: name.into(),
            topics,
            event_bus,
            store,
            handler,
            shutdown,
            retry_delay: Duration::from_secs(5),
        }
    }

    /// Set custom retry delay.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Spawn the consumer as a background task.
    #[must_use]
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Handle one message: dedup through the inbox, then run the handler in
    /// the same transaction.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumeError`] if the store or the handler failed. Nothing
    /// was committed; the message should be redelivered.
    pub async fn handle_message(&self, message: &InboundMessage) -> Result<Handled, ConsumeError> {
        let meta = EventMeta::from_message(message);
        let trace = TraceContext::from_headers(&message.headers);
        let span = info_span!(
            "consume",
            consumer = %self.name,
            event_id = %meta.event_id,
            event_type = %meta.event_type,
            traceparent = trace.traceparent.as_deref().unwrap_or_default(),
            trace_id = trace.trace_id().unwrap_or_default(),
        );

        self.dedup_and_handle(&meta, message).instrument(span).await
    }

    async fn dedup_and_handle(
        &self,
        meta: &EventMeta,
        message: &InboundMessage,
    ) -> Result<Handled, ConsumeError> {
        let mut tx = self.store.begin().await?;
        let admission = self
            .store
            .record(&mut tx, &meta.event_id, &meta.event_type)
            .await?;
        if admission.is_duplicate() {
            self.store.rollback(tx).await?;
            ConsumerMetrics::record_duplicate();
            debug!("Event already processed, skipping");
            return Ok(Handled::Duplicate);
        }

        self.handler.handle(&mut tx, message).await?;
        self.store.commit(tx).await?;
        ConsumerMetrics::record_handled();
        Ok(Handled::Processed)
    }

    /// Run the consumer until the shutdown signal.
    pub async fn run(&mut self) {
        info!(consumer = %self.name, "Event consumer started");

        loop {
            let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();

            let subscribed = tokio::select! {
                _ = self.shutdown.recv() => break,
                result = self.event_bus.subscribe(&topics) => result,
            };

            match subscribed {
                Ok(mut stream) => {
                    info!(consumer = %self.name, topics = ?self.topics, "Subscribed to event bus");
                    if self.process_stream(&mut stream).await {
                        break;
                    }
                    warn!(
                        consumer = %self.name,
                        "Event stream ended, reconnecting in {:?}",
                        self.retry_delay
                    );
                }
                Err(e) => {
                    error!(
                        consumer = %self.name,
                        error = %e,
                        "Failed to subscribe to event bus, retrying in {:?}",
                        self.retry_delay
                    );
                }
            }

            if self.pause().await {
                break;
            }
        }

        info!(consumer = %self.name, "Event consumer stopped");
    }

    /// Process deliveries until the stream ends. Returns `true` on shutdown.
    async fn process_stream(&mut self, stream: &mut DeliveryStream) -> bool {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.recv() => return true,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let result = self.handle_message(delivery.message()).await;
                    if let Err(e) = result {
                        ConsumerMetrics::record_failure();
                        error!(
                            consumer = %self.name,
                            error = %e,
                            "Failed to handle event, leaving it for redelivery"
                        );
                        drop(delivery);
                        if self.pause().await {
                            return true;
                        }
                    } else {
                        delivery.ack();
                    }
                }
                Some(Err(e)) => {
                    error!(
                        consumer = %self.name,
                        error = %e,
                        "Error receiving event from stream, retrying in {:?}",
                        self.retry_delay
                    );
                    if self.pause().await {
                        return true;
                    }
                }
                None => return false,
            }
        }
    }

    /// Sleep for `retry_delay`. Returns `true` if shutdown arrived first.
    async fn pause(&mut self) -> bool {
        tokio::select! {
            _ = self.shutdown.recv() => true,
            () = tokio::time::sleep(self.retry_delay) => false,
        }
    }
}
