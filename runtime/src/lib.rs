//! # Relay Runtime
//!
//! The background loops and request wrappers built on the `relay-core`
//! store traits.
//!
//! ## Core Components
//!
//! - **Outbox publisher**: forwards committed outbox rows to the event bus
//! - **Event consumer**: deduplicates deliveries through the inbox and runs
//!   the handler in the same transaction
//! - **Job worker**: turns due scheduled jobs into outbox events, with retry,
//!   backoff and dead-lettering
//! - **Idempotency executor**: lock / replay / execute / finalize for
//!   client-retried writes
//!
//! ## Example
//!
//! ```ignore
//! use relay_runtime::{OutboxPublisher, JobWorker, FixedBackoff};
//!
//! let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
//!
//! let publisher = OutboxPublisher::new(store.clone(), Some(bus.clone()))
//!     .spawn(shutdown_tx.subscribe());
//! let worker = JobWorker::new(store.clone(), handler, Arc::new(FixedBackoff::default()))
//!     .spawn(shutdown_tx.subscribe());
//!
//! // ... later
//! let _ = shutdown_tx.send(());
//! publisher.await?;
//! worker.await?;
//! ```

#![forbid(unsafe_code)]

/// Retry delay policies for scheduled jobs
pub mod backoff;

/// Inbox-deduplicating event consumer
pub mod consumer;

/// Idempotent execution of keyed requests
pub mod idempotency;

/// Prometheus metrics for observability
pub mod metrics;

/// Outbox publisher loop
pub mod publisher;

/// Scheduled job worker loop
pub mod worker;

pub use backoff::{ExponentialBackoff, FixedBackoff};
pub use consumer::{ConsumeError, EventConsumer, Handled};
pub use idempotency::{
    Completion, IdempotencyError, IdempotencyExecutor, IdempotentOperation, IdempotentOutcome,
};
pub use publisher::{OutboxPublisher, PublishError, PublisherConfig};
pub use worker::{BatchReport, JobHandler, JobWorker, WorkerConfig, WorkerError};
