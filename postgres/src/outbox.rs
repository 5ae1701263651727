use crate::{PgTx, PostgresStore, db_error, sql_limit};
use chrono::{DateTime, Utc};
use relay_core::outbox::{NewOutboxEvent, OutboxRecord, OutboxStore};
use relay_core::store::{Admission, StoreError};
use relay_core::trace_context::TraceContext;
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

impl OutboxStore for PostgresStore {
    async fn insert_event(
        &self,
        tx: &mut PgTx,
        event: &NewOutboxEvent,
    ) -> Result<Admission<(i64, Uuid)>, StoreError> {
        let event_id = Uuid::new_v4();
        let inserted: Option<(i64,)> = sqlx::query_as(
            r"
            INSERT INTO outbox_events (
                event_id, aggregate_type, aggregate_id, event_type, payload,
                traceparent, tracestate, dedup_key
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (dedup_key) DO NOTHING
            RETURNING id
            ",
        )
        .bind(event_id)
        .bind(&event.aggregate_type)
        .bind(&event.aggregate_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(&event.trace.traceparent)
        .bind(&event.trace.tracestate)
        .bind(&event.dedup_key)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_error)?;

        match inserted {
            Some((id,)) => Ok(Admission::Admitted((id, event_id))),
            None => {
                tracing::debug!(
                    dedup_key = ?event.dedup_key,
                    event_type = %event.event_type,
                    "Outbox event already stored"
                );
                Ok(Admission::Duplicate)
            }
        }
    }

    async fn acquire_batch(
        &self,
        tx: &mut PgTx,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT
                id, event_id, aggregate_type, aggregate_id, event_type, payload,
                traceparent, tracestate, dedup_key, created_at, published_at
            FROM outbox_events
            WHERE published_at IS NULL
            ORDER BY id
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(sql_limit(limit))
        .fetch_all(&mut **tx)
        .await
        .map_err(db_error)?;

        rows.iter().map(row_to_record).collect()
    }

    async fn mark_published(
        &self,
        tx: &mut PgTx,
        ids: &[i64],
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE outbox_events
            SET published_at = $2
            WHERE id = ANY($1) AND published_at IS NULL
            ",
        )
        .bind(ids)
        .bind(at)
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;
        Ok(())
    }
}

fn row_to_record(row: &PgRow) -> Result<OutboxRecord, StoreError> {
    Ok(OutboxRecord {
        id: row.try_get("id").map_err(db_error)?,
        event_id: row.try_get("event_id").map_err(db_error)?,
        aggregate_type: row.try_get("aggregate_type").map_err(db_error)?,
        aggregate_id: row.try_get("aggregate_id").map_err(db_error)?,
        event_type: row.try_get("event_type").map_err(db_error)?,
        payload: row.try_get("payload").map_err(db_error)?,
        trace: TraceContext {
            traceparent: row.try_get("traceparent").map_err(db_error)?,
            tracestate: row.try_get("tracestate").map_err(db_error)?,
        },
        dedup_key: row.try_get("dedup_key").map_err(db_error)?,
        created_at: row.try_get("created_at").map_err(db_error)?,
        published_at: row.try_get("published_at").map_err(db_error)?,
    })
}
