//! Outbox publisher: forwards committed outbox rows to the bus.
//!
//! # Pattern: Claim-Send-Mark
//!
//! ```text
//! every poll_interval:
//!     begin
//!     rows = acquire_batch(batch_size)      -- skip-locked, ordered by id
//!     for row in rows: bus.publish(row)      -- any failure: rollback, retry next tick
//!     mark_published(rows)
//!     commit
//! ```
//!
//! Nothing is marked published before the bus accepted it, so a row is never
//! lost. A batch that fails half-way is sent again in full on the next tick,
//! so receivers see duplicates and dedup them through their inbox.
//!
//! Several publisher replicas can run against the same table: claimed rows
//! are skipped, so each replica publishes distinct rows.

use crate::metrics::OutboxMetrics;
use relay_core::environment::{Clock, SystemClock};
use relay_core::event_bus::{EventBus, EventBusError};
use relay_core::outbox::OutboxStore;
use relay_core::store::StoreError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

/// Errors from one publisher batch. The batch was rolled back.
#[derive(Error, Debug)]
pub enum PublishError {
    /// The outbox store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The bus rejected an event.
    #[error("Failed to publish event {event_id}: {source}")]
    Bus {
        /// Event that could not be sent
        event_id: Uuid,
        /// Bus error
        source: EventBusError,
    },

    /// The publisher has no bus configured.
    #[error("Publisher has no event bus configured")]
    Disabled,
}

/// Publisher settings.
///
/// # Default Values
///
/// - `poll_interval`: 2 seconds
/// - `batch_size`: 50
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Delay between polls
    pub poll_interval: Duration,
    /// Maximum rows per batch
    pub batch_size: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            batch_size: 50,
        }
    }
}

impl PublisherConfig {
    /// Set the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Background task publishing outbox rows.
pub struct OutboxPublisher<S> {
    store: Arc<S>,
    event_bus: Option<Arc<dyn EventBus>>,
    clock: Arc<dyn Clock>,
    config: PublisherConfig,
}

impl<S: OutboxStore + 'static> OutboxPublisher<S> {
    /// Create a publisher with default settings.
    ///
    /// Without a bus the publisher is disabled: [`OutboxPublisher::run`]
    /// returns immediately and rows stay unpublished.
    #[must_use]
    pub fn new(store: Arc<S>, event_bus: Option<Arc<dyn EventBus>>) -> Self {
        Self {
            store,
            event_bus,
            clock: Arc::new(SystemClock),
            config: PublisherConfig::default(),
        }
    }

    /// Replace the settings.
    #[must_use]
    pub fn with_config(mut self, config: PublisherConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the clock used for `published_at`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Publish one batch.
    ///
    /// Returns the number of rows published. Zero means there was nothing to
    /// publish.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if the store or the bus failed; the whole
    /// batch was rolled back and stays unpublished.
    pub async fn publish_batch(&self) -> Result<usize, PublishError> {
        let Some(event_bus) = &self.event_bus else {
            return Err(PublishError::Disabled);
        };
        let started = Instant::now();

        let mut tx = self.store.begin().await?;
        let batch = self
            .store
            .acquire_batch(&mut tx, self.config.batch_size)
            .await?;
        if batch.is_empty() {
            self.store.rollback(tx).await?;
            return Ok(0);
        }

        let mut ids = Vec::with_capacity(batch.len());
        for record in &batch {
            let span = info_span!(
                "outbox_publish",
                event_id = %record.event_id,
                event_type = %record.event_type,
                aggregate_id = %record.aggregate_id,
                traceparent = record.trace.traceparent.as_deref().unwrap_or_default(),
            );
            let message = record.to_message();
            event_bus
                .publish(&message)
                .instrument(span)
                .await
                .map_err(|source| PublishError::Bus {
                    event_id: record.event_id,
                    source,
                })?;
            ids.push(record.id);
        }

        self.store
            .mark_published(&mut tx, &ids, self.clock.now())
            .await?;
        self.store.commit(tx).await?;

        OutboxMetrics::record_batch(ids.len(), started.elapsed());
        debug!(count = ids.len(), "Published outbox batch");
        Ok(ids.len())
    }

    /// Spawn the publisher as a background task.
    #[must_use]
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()>
    where
        S::Tx: 'static,
    {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    /// Poll until the shutdown signal.
    ///
    /// A batch interrupted by shutdown is dropped and its transaction rolls
    /// back.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        if self.event_bus.is_none() {
            warn!("Outbox publisher disabled: no event bus configured");
            return;
        }
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis(),
            batch_size = self.config.batch_size,
            "Outbox publisher started"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Outbox publisher interrupted, batch rolled back");
                    break;
                }
                result = self.publish_batch() => {
                    if let Err(e) = result {
                        OutboxMetrics::record_failure();
                        error!(error = %e, "Outbox batch failed, retrying next tick");
                    }
                }
            }
        }

        info!("Outbox publisher stopped");
    }
}
