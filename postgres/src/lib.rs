//! `PostgreSQL` store for the Relay delivery core.
//!
//! [`PostgresStore`] implements every store trait of `relay-core` on one
//! connection pool, so a single transaction can span the domain tables, the
//! outbox, the inbox, the idempotency keys and the job queue:
//!
//! - claiming uses `FOR UPDATE SKIP LOCKED`, so publisher and worker replicas
//!   split the work
//! - dedup points are unique constraints with `ON CONFLICT DO NOTHING`; a
//!   concurrent insert of the same key blocks until the first transaction
//!   ends
//! - savepoints map to SQL `SAVEPOINT`
//!
//! # Example
//!
//! ```ignore
//! use relay_postgres::PostgresStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresStore::new("postgres://localhost/scheduler").await?;
//!     store.run_migrations().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use relay_core::store::{StoreError, Transactional};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};

mod idempotency;
mod inbox;
mod jobs;
mod outbox;

/// Transaction handle of [`PostgresStore`].
pub type PgTx = Transaction<'static, Postgres>;

/// sqlx-backed implementation of every store trait.
///
/// Cloning shares the pool.
#[derive(Clone, Debug)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect with a pool of up to 10 connections.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the connection fails.
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        Self::connect(database_url, 10).await
    }

    /// Connect with a pool of up to `max_connections` connections.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the connection fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to connect: {e}")))?;
        Ok(Self::from_pool(pool))
    }

    /// Use an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool, for the domain tables living next to ours.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Round-trip `SELECT 1` through the pool, for readiness checks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if no connection answers.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    /// Create the outbox, inbox, idempotency and job tables if missing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        tracing::info!("Database migrations applied");
        Ok(())
    }
}

pub(crate) fn db_error(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

/// Savepoint names are interpolated into SQL, so only identifiers pass.
fn savepoint_sql(verb: &str, name: &str) -> Result<String, StoreError> {
    let valid = !name.is_empty()
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
        && !name.as_bytes()[0].is_ascii_digit();
    if !valid {
        return Err(StoreError::InvalidData(format!(
            "Invalid savepoint name: {name:?}"
        )));
    }
    Ok(format!("{verb} {name}"))
}

impl Transactional for PostgresStore {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx, StoreError> {
        self.pool.begin().await.map_err(db_error)
    }

    async fn commit(&self, tx: PgTx) -> Result<(), StoreError> {
        tx.commit().await.map_err(db_error)
    }

    async fn rollback(&self, tx: PgTx) -> Result<(), StoreError> {
        tx.rollback().await.map_err(db_error)
    }

    async fn savepoint(&self, tx: &mut PgTx, name: &'static str) -> Result<(), StoreError> {
        let sql = savepoint_sql("SAVEPOINT", name)?;
        sqlx::query(&sql)
            .execute(&mut **tx)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn rollback_to_savepoint(
        &self,
        tx: &mut PgTx,
        name: &'static str,
    ) -> Result<(), StoreError> {
        let sql = savepoint_sql("ROLLBACK TO SAVEPOINT", name)?;
        sqlx::query(&sql)
            .execute(&mut **tx)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn release_savepoint(
        &self,
        tx: &mut PgTx,
        name: &'static str,
    ) -> Result<(), StoreError> {
        let sql = savepoint_sql("RELEASE SAVEPOINT", name)?;
        sqlx::query(&sql)
            .execute(&mut **tx)
            .await
            .map_err(db_error)?;
        Ok(())
    }
}

/// Row limit for a `LIMIT` bind.
pub(crate) fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
