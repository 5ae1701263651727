//! Transactional outbox records and store contract.
//!
//! A domain handler writes its state change and a [`NewOutboxEvent`] in one
//! transaction. The event exists if and only if the mutation committed; the
//! publisher later forwards it to the bus.

use crate::message::{EVENT_ID_HEADER, EVENT_TYPE_HEADER, Headers, OutboundMessage};
use crate::store::{Admission, StoreError, Transactional};
use crate::trace_context::TraceContext;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use uuid::Uuid;

/// An event to append to the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboxEvent {
    /// Kind of aggregate that produced the event (e.g. `appointment`).
    pub aggregate_type: String,
    /// Aggregate id; becomes the bus message key.
    pub aggregate_id: String,
    /// Event type; doubles as the bus topic.
    pub event_type: String,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Trace context of the producing request.
    pub trace: TraceContext,
    /// Optional idempotency key; a second insert with the same key is a duplicate.
    pub dedup_key: Option<String>,
}

impl NewOutboxEvent {
    /// Create an event with no trace context and no dedup key.
    #[must_use]
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload: payload.into(),
            trace: TraceContext::empty(),
            dedup_key: None,
        }
    }

    /// Create an event whose payload is `value` encoded as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if `value` cannot be encoded.
    pub fn json<T: Serialize + ?Sized>(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        value: &T,
    ) -> Result<Self, StoreError> {
        let payload =
            serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Self::new(aggregate_type, aggregate_id, event_type, payload))
    }

    /// Attach the trace context of the producing request.
    #[must_use]
    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = trace;
        self
    }

    /// Attach a dedup key.
    #[must_use]
    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }
}

/// A stored outbox row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRecord {
    /// Monotonic row id; publishing order.
    pub id: i64,
    /// External correlation id, sent as the `event_id` header.
    pub event_id: Uuid,
    /// Kind of aggregate that produced the event.
    pub aggregate_type: String,
    /// Aggregate id.
    pub aggregate_id: String,
    /// Event type and topic.
    pub event_type: String,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Stored trace context.
    pub trace: TraceContext,
    /// Dedup key the row was inserted with.
    pub dedup_key: Option<String>,
    /// Insert time.
    pub created_at: DateTime<Utc>,
    /// Set once the bus confirmed the send. Never unset.
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Returns `true` once the row was confirmed delivered.
    #[must_use]
    pub const fn is_published(&self) -> bool {
        self.published_at.is_some()
    }

    /// Build the bus message for this row.
    ///
    /// Topic is the event type, key is the aggregate id, headers carry the
    /// event id, event type and any stored trace context.
    #[must_use]
    pub fn to_message(&self) -> OutboundMessage {
        let mut headers = Headers::new();
        headers.insert(EVENT_ID_HEADER, self.event_id.to_string());
        headers.insert(EVENT_TYPE_HEADER, self.event_type.as_bytes());
        self.trace.inject(&mut headers);

        OutboundMessage {
            topic: self.event_type.clone(),
            key: self.aggregate_id.as_bytes().to_vec(),
            headers,
            payload: self.payload.clone(),
        }
    }
}

/// Outbox table access.
pub trait OutboxStore: Transactional {
    /// Append an event inside the caller's transaction.
    ///
    /// Returns the new row id and event id, or [`Admission::Duplicate`] if the
    /// event carries a dedup key that is already stored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the row cannot be written.
    fn insert_event(
        &self,
        tx: &mut Self::Tx,
        event: &NewOutboxEvent,
    ) -> impl Future<Output = Result<Admission<(i64, Uuid)>, StoreError>> + Send;

    /// Claim up to `limit` unpublished rows, ordered by id.
    ///
    /// Returned rows are owned by `tx` until it ends; concurrent callers skip
    /// them instead of waiting.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the rows cannot be read.
    fn acquire_batch(
        &self,
        tx: &mut Self::Tx,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<OutboxRecord>, StoreError>> + Send;

    /// Set `published_at` on the given rows. Already published rows keep
    /// their original timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    fn mark_published(
        &self,
        tx: &mut Self::Tx,
        ids: &[i64],
        at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}
