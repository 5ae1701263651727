//! Idempotent execution of client-retried write requests.
//!
//! [`IdempotencyExecutor`] packages the lock / replay / execute / finalize
//! contract of the idempotency-key ledger:
//!
//! ```text
//! begin
//! lock_key(business, key)
//!     finalized  ─► rollback, replay stored response
//!     otherwise  ─► operation.execute(tx)
//!                       Finalize(resp)         ─► finalize_key, commit
//!                       LeaveUnfinalized(resp) ─► rollback (client may retry)
//!                       Err(e)                 ─► rollback
//! ```
//!
//! A concurrent request with the same key blocks in `lock_key` until the first
//! transaction ends, then replays whatever it committed.

use crate::metrics::IdempotencyMetrics;
use relay_core::idempotency::{IdempotencyStore, StoredResponse};
use relay_core::store::StoreError;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// How an operation wants its outcome recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Record the response under the key and commit. Used for successes and
    /// for deterministic rejections that a retry would repeat.
    Finalize(StoredResponse),
    /// Roll back and return the response without recording it, so a retry
    /// with the same key runs again. Used when a dependency was unavailable.
    LeaveUnfinalized(StoredResponse),
}

/// The response to send and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotentOutcome {
    /// The operation ran and its outcome was committed.
    Executed(StoredResponse),
    /// A finalized outcome for the key was replayed; nothing ran.
    Replayed(StoredResponse),
    /// The operation ran and was rolled back; the key stays open.
    NotFinalized(StoredResponse),
}

impl IdempotentOutcome {
    /// The response to send.
    #[must_use]
    pub const fn response(&self) -> &StoredResponse {
        match self {
            Self::Executed(r) | Self::Replayed(r) | Self::NotFinalized(r) => r,
        }
    }

    /// Take the response to send.
    #[must_use]
    pub fn into_response(self) -> StoredResponse {
        match self {
            Self::Executed(r) | Self::Replayed(r) | Self::NotFinalized(r) => r,
        }
    }

    /// Returns `true` if the response was replayed.
    #[must_use]
    pub const fn is_replay(&self) -> bool {
        matches!(self, Self::Replayed(_))
    }
}

/// Errors from idempotent execution. The transaction was rolled back.
#[derive(Error, Debug)]
pub enum IdempotencyError<E> {
    /// The store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The operation failed.
    #[error("Operation failed: {0}")]
    Operation(E),
}

/// Business logic guarded by an idempotency key.
pub trait IdempotentOperation<S: IdempotencyStore>: Send {
    /// Error type of the operation.
    type Error: Send;

    /// Run inside `tx`, the transaction holding the key lock.
    ///
    /// # Errors
    ///
    /// Returning an error rolls the transaction back; the key stays open.
    fn execute(
        self,
        tx: &mut S::Tx,
    ) -> impl Future<Output = Result<Completion, Self::Error>> + Send;
}

/// Runs [`IdempotentOperation`]s under idempotency keys.
pub struct IdempotencyExecutor<S> {
    store: Arc<S>,
}

impl<S> Clone for IdempotencyExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: IdempotencyStore> IdempotencyExecutor<S> {
    /// Create an executor over `store`.
    #[must_use]
    pub const fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Run `operation`, guarded by `key` when present.
    ///
    /// Without a key the operation simply runs in its own transaction and a
    /// `Finalize` completion commits it.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError`] if the store or the operation failed.
    pub async fn execute<O>(
        &self,
        business_id: &str,
        key: Option<&str>,
        operation: O,
    ) -> Result<IdempotentOutcome, IdempotencyError<O::Error>>
    where
        O: IdempotentOperation<S>,
    {
        let mut tx = self.store.begin().await?;

        if let Some(key) = key {
            let locked = self.store.lock_key(&mut tx, business_id, key).await?;
            if let Some(stored) = locked.replay() {
                self.store.rollback(tx).await?;
                IdempotencyMetrics::record_replay();
                debug!(business_id, idempotency_key = key, "Replaying finalized response");
                return Ok(IdempotentOutcome::Replayed(stored));
            }
        }

        let completion = match operation.execute(&mut tx).await {
            Ok(completion) => completion,
            Err(e) => {
                self.store.rollback(tx).await?;
                return Err(IdempotencyError::Operation(e));
            }
        };

        match completion {
            Completion::Finalize(response) => {
                if let Some(key) = key {
                    self.store
                        .finalize_key(&mut tx, business_id, key, &response)
                        .await?;
                }
                self.store.commit(tx).await?;
                Ok(IdempotentOutcome::Executed(response))
            }
            Completion::LeaveUnfinalized(response) => {
                self.store.rollback(tx).await?;
                debug!(
                    business_id,
                    status_code = response.status_code,
                    "Leaving idempotency key unfinalized"
                );
                Ok(IdempotentOutcome::NotFinalized(response))
            }
        }
    }
}
