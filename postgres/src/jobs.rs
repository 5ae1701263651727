use crate::{PgTx, PostgresStore, db_error, sql_limit};
use chrono::{DateTime, Utc};
use relay_core::jobs::{JobFailure, JobStatus, JobStore, NewScheduledJob, ScheduledJob};
use relay_core::store::{Admission, StoreError};
use relay_core::trace_context::TraceContext;
use sqlx::Row;
use sqlx::postgres::PgRow;

fn to_i32(value: u32, field: &str) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::InvalidData(format!("{field} out of range: {value}")))
}

fn to_u32(value: i32, field: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::InvalidData(format!("Negative {field}: {value}")))
}

impl JobStore for PostgresStore {
    async fn insert_job(
        &self,
        tx: &mut PgTx,
        job: &NewScheduledJob,
    ) -> Result<Admission<i64>, StoreError> {
        let inserted: Option<(i64,)> = sqlx::query_as(
            r"
            INSERT INTO scheduled_jobs (
                idempotency_key, payload, status, attempts, max_attempts,
                next_run_at, traceparent, tracestate
            ) VALUES ($1, $2, 'pending', 0, $3, $4, $5, $6)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING id
            ",
        )
        .bind(&job.idempotency_key)
        .bind(&job.payload)
        .bind(to_i32(job.max_attempts, "max_attempts")?)
        .bind(job.run_at)
        .bind(&job.trace.traceparent)
        .bind(&job.trace.tracestate)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_error)?;

        Ok(inserted.map_or(Admission::Duplicate, |(id,)| Admission::Admitted(id)))
    }

    async fn fetch_due(
        &self,
        tx: &mut PgTx,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT
                id, idempotency_key, payload, status, attempts, max_attempts,
                next_run_at, last_error, traceparent, tracestate,
                created_at, updated_at
            FROM scheduled_jobs
            WHERE status = 'pending' AND next_run_at <= $1
            ORDER BY next_run_at, id
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(now)
        .bind(sql_limit(limit))
        .fetch_all(&mut **tx)
        .await
        .map_err(db_error)?;

        rows.iter().map(row_to_job).collect()
    }

    async fn mark_processed(
        &self,
        tx: &mut PgTx,
        ids: &[i64],
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE scheduled_jobs
            SET status = 'processed', updated_at = $2
            WHERE id = ANY($1)
            ",
        )
        .bind(ids)
        .bind(at)
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn record_failure(
        &self,
        tx: &mut PgTx,
        failure: &JobFailure,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE scheduled_jobs
            SET attempts = $2,
                status = $3,
                next_run_at = $4,
                last_error = $5,
                updated_at = $6
            WHERE id = $1
            ",
        )
        .bind(failure.job_id)
        .bind(to_i32(failure.attempts, "attempts")?)
        .bind(failure.status.as_str())
        .bind(failure.next_run_at)
        .bind(&failure.last_error)
        .bind(at)
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;
        Ok(())
    }
}

fn row_to_job(row: &PgRow) -> Result<ScheduledJob, StoreError> {
    let status: String = row.try_get("status").map_err(db_error)?;

    Ok(ScheduledJob {
        id: row.try_get("id").map_err(db_error)?,
        idempotency_key: row.try_get("idempotency_key").map_err(db_error)?,
        payload: row.try_get("payload").map_err(db_error)?,
        status: JobStatus::parse(&status)?,
        attempts: to_u32(row.try_get("attempts").map_err(db_error)?, "attempts")?,
        max_attempts: to_u32(row.try_get("max_attempts").map_err(db_error)?, "max_attempts")?,
        next_run_at: row.try_get("next_run_at").map_err(db_error)?,
        last_error: row.try_get("last_error").map_err(db_error)?,
        trace: TraceContext {
            traceparent: row.try_get("traceparent").map_err(db_error)?,
            tracestate: row.try_get("tracestate").map_err(db_error)?,
        },
        created_at: row.try_get("created_at").map_err(db_error)?,
        updated_at: row.try_get("updated_at").map_err(db_error)?,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn counters_must_fit_the_columns() {
        assert_eq!(to_i32(5, "attempts").unwrap(), 5);
        assert!(to_i32(u32::MAX, "attempts").is_err());
        assert_eq!(to_u32(3, "attempts").unwrap(), 3);
        assert!(to_u32(-1, "attempts").is_err());
    }
}
