//! Unit-of-work abstraction shared by every store.
//!
//! Each service owns one transactional store (Postgres in production, in-memory
//! in tests). The outbox, inbox, idempotency and job tables are all accessed
//! through the same transaction type so that callers can compose them:
//!
//! ```text
//! begin ─► mutate business state ─► outbox.insert ─► commit
//!                                                   │
//!                     (dropped without commit) ─────┴─► rollback
//! ```
//!
//! # Savepoints
//!
//! Batch loops (the job worker in particular) run several independent steps
//! inside one transaction. A failed step is rolled back to a savepoint so the
//! rest of the batch can still commit.

use std::future::Future;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Database or connection error.
    #[error("Database error: {0}")]
    Database(String),

    /// Payload could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A row contained data that does not map onto the domain model.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Failure injected by a test store.
    #[error("Injected fault: {0}")]
    FaultInjected(String),
}

/// Explicit "already done" result shared by every dedup point.
///
/// Duplicate submissions (an inbox conflict, an outbox dedup-key conflict, a
/// repeated job key) are not errors: the work they describe has already been
/// recorded once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Admission<T> {
    /// The write was accepted.
    Admitted(T),
    /// An equivalent write already exists; nothing was changed.
    Duplicate,
}

impl<T> Admission<T> {
    /// Returns `true` if the write was accepted.
    #[must_use]
    pub const fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }

    /// Returns `true` if an equivalent write already existed.
    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate)
    }

    /// Converts into an `Option`, discarding the duplicate marker.
    #[must_use]
    pub fn admitted(self) -> Option<T> {
        match self {
            Self::Admitted(value) => Some(value),
            Self::Duplicate => None,
        }
    }
}

/// A store that hands out transactions.
///
/// Dropping a transaction without calling [`Transactional::commit`] must roll
/// it back and release every row it claimed.
pub trait Transactional: Send + Sync {
    /// Transaction handle passed to every store operation.
    type Tx: Send;

    /// Begin a new transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if no connection is available.
    fn begin(&self) -> impl Future<Output = Result<Self::Tx, StoreError>> + Send;

    /// Commit a transaction, making its writes visible and releasing its locks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the commit fails; the transaction is then
    /// rolled back.
    fn commit(&self, tx: Self::Tx) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Roll a transaction back explicitly.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the rollback could not be sent.
    fn rollback(&self, tx: Self::Tx) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Mark a savepoint inside `tx`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the savepoint cannot be created.
    fn savepoint(
        &self,
        tx: &mut Self::Tx,
        name: &'static str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Undo every write made since the named savepoint.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the savepoint is unknown.
    fn rollback_to_savepoint(
        &self,
        tx: &mut Self::Tx,
        name: &'static str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Forget the named savepoint, keeping the writes made since.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the savepoint is unknown.
    fn release_savepoint(
        &self,
        tx: &mut Self::Tx,
        name: &'static str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}
