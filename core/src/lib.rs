//! # Relay Core
//!
//! Records, store contracts and bus contracts for reliable event delivery.
//!
//! Four mechanisms share one rule: never lose an effect, never duplicate its
//! externally visible result.
//!
//! - **Outbox** ([`outbox`]): an event is written in the same transaction as
//!   the state change that produced it, and published later.
//! - **Inbox** ([`inbox`]): a ledger of handled event ids turns at-least-once
//!   delivery into effectively-once effects.
//! - **Idempotency keys** ([`idempotency`]): client-retried writes replay
//!   the first outcome instead of running again.
//! - **Scheduled jobs** ([`jobs`]): due-time work with bounded retries,
//!   backoff and one dead-letter event.
//!
//! This crate has no I/O. Stores live in `relay-postgres` and
//! `relay-testing`, the bus in `relay-redpanda`, and the loops that drive
//! everything in `relay-runtime`.

#![forbid(unsafe_code)]

pub mod event_bus;
pub mod idempotency;
pub mod inbox;
pub mod jobs;
pub mod message;
pub mod outbox;
pub mod store;
pub mod trace_context;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use event_bus::{DeliveryStream, EventBus, EventBusError};
pub use idempotency::{IdempotencyRecord, IdempotencyStore, LockedKey, StoredResponse};
pub use inbox::{HandlerError, InboxRecord, InboxStore, MessageHandler};
pub use jobs::{BackoffPolicy, JobFailure, JobStatus, JobStore, NewScheduledJob, ScheduledJob};
pub use message::{Delivery, EventMeta, Headers, InboundMessage, OutboundMessage};
pub use outbox::{NewOutboxEvent, OutboxRecord, OutboxStore};
pub use store::{Admission, StoreError, Transactional};
pub use trace_context::TraceContext;

/// Injected dependencies.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
