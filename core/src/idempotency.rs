//! Idempotency-key ledger for client-retried write requests.
//!
//! ```text
//! lock_key ──► Reserved ──► business logic ──► finalize_key ──► commit
//!     │
//!     └──────► Existing ──► finalized? ── yes ─► replay stored response
//!                               │
//!                               no ──► re-run business logic
//! ```

use crate::store::{StoreError, Transactional};
use chrono::{DateTime, Utc};
use std::future::Future;

/// A stored key reservation, finalized or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    /// Tenant the key is scoped to.
    pub business_id: String,
    /// Client-supplied key.
    pub idempotency_key: String,
    /// Resource the original request created, if any.
    pub resource_id: Option<String>,
    /// Finalized status code. `None` while only reserved.
    pub status_code: Option<u16>,
    /// Finalized response body.
    pub response_body: Option<Vec<u8>>,
    /// Reservation time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// A bare reservation for `(business_id, key)`.
    #[must_use]
    pub fn reservation(
        business_id: impl Into<String>,
        key: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            business_id: business_id.into(),
            idempotency_key: key.into(),
            resource_id: None,
            status_code: None,
            response_body: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns `true` once an outcome was recorded.
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        self.status_code.is_some()
    }

    /// The recorded outcome, if finalized.
    #[must_use]
    pub fn stored_response(&self) -> Option<StoredResponse> {
        self.status_code.map(|status_code| StoredResponse {
            resource_id: self.resource_id.clone(),
            status_code,
            body: self.response_body.clone().unwrap_or_default(),
        })
    }
}

/// The outcome of a request, replayed verbatim for retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    /// Created resource, if any.
    pub resource_id: Option<String>,
    /// HTTP status code.
    pub status_code: u16,
    /// Response body bytes.
    pub body: Vec<u8>,
}

impl StoredResponse {
    /// Response with a body and no resource id.
    #[must_use]
    pub fn new(status_code: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            resource_id: None,
            status_code,
            body: body.into(),
        }
    }

    /// Set the created resource id.
    #[must_use]
    pub fn with_resource_id(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }
}

/// Result of [`IdempotencyStore::lock_key`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockedKey {
    /// A row already existed; check [`IdempotencyRecord::is_finalized`].
    Existing(IdempotencyRecord),
    /// A bare reservation was created by this transaction.
    Reserved(IdempotencyRecord),
}

impl LockedKey {
    /// The locked record.
    #[must_use]
    pub const fn record(&self) -> &IdempotencyRecord {
        match self {
            Self::Existing(record) | Self::Reserved(record) => record,
        }
    }

    /// The outcome to replay, if the key was already finalized.
    #[must_use]
    pub fn replay(&self) -> Option<StoredResponse> {
        match self {
            Self::Existing(record) => record.stored_response(),
            Self::Reserved(_) => None,
        }
    }
}

/// Idempotency table access.
pub trait IdempotencyStore: Transactional {
    /// Lock `(business_id, key)` for the rest of `tx`, reserving it if absent.
    ///
    /// A concurrent transaction locking the same key waits until this one
    /// ends, then observes whatever it committed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the row cannot be read or inserted.
    fn lock_key(
        &self,
        tx: &mut Self::Tx,
        business_id: &str,
        key: &str,
    ) -> impl Future<Output = Result<LockedKey, StoreError>> + Send;

    /// Record the outcome for a key locked by `tx`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    fn finalize_key(
        &self,
        tx: &mut Self::Tx,
        business_id: &str,
        key: &str,
        response: &StoredResponse,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}
