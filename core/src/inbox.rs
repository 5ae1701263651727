//! Consumer-side dedup ledger and handler contract.

use crate::message::InboundMessage;
use crate::store::{Admission, StoreError, Transactional};
use chrono::{DateTime, Utc};
use std::future::Future;
use thiserror::Error;

/// A handled event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxRecord {
    /// Event id; unique.
    pub event_id: String,
    /// Event type.
    pub event_type: String,
    /// When the event was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Inbox table access.
pub trait InboxStore: Transactional {
    /// Record an event as handled.
    ///
    /// A second record with the same `event_id` is a uniqueness conflict and
    /// yields [`Admission::Duplicate`]; the existing row is never updated.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] for anything other than the uniqueness conflict.
    fn record(
        &self,
        tx: &mut Self::Tx,
        event_id: &str,
        event_type: &str,
    ) -> impl Future<Output = Result<Admission<()>, StoreError>> + Send;
}

/// Error returned by a message handler to ask for redelivery.
///
/// Permanent problems with a message (a malformed payload) should be logged
/// and swallowed by the handler instead, or the message is redelivered forever.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// A store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The handler could not finish for another transient reason.
    #[error("Handler failed: {0}")]
    Failed(String),
}

/// Application logic run at most once per event.
///
/// The handler receives the consumer's open transaction, the same one that
/// holds the inbox entry. Its writes commit together with the entry, or not
/// at all.
pub trait MessageHandler<S: Transactional>: Send + Sync {
    /// Handle one message.
    ///
    /// # Errors
    ///
    /// Returning an error rolls back the transaction (inbox entry included)
    /// and leaves the message unacknowledged for redelivery.
    fn handle(
        &self,
        tx: &mut S::Tx,
        message: &InboundMessage,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send;
}
