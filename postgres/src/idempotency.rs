use crate::{PgTx, PostgresStore, db_error};
use relay_core::idempotency::{IdempotencyRecord, IdempotencyStore, LockedKey, StoredResponse};
use relay_core::store::StoreError;
use sqlx::Row;
use sqlx::postgres::PgRow;

const COLUMNS: &str =
    "business_id, idempotency_key, resource_id, status_code, response_body, created_at, updated_at";

impl IdempotencyStore for PostgresStore {
    async fn lock_key(
        &self,
        tx: &mut PgTx,
        business_id: &str,
        key: &str,
    ) -> Result<LockedKey, StoreError> {
        // The insert blocks while another transaction holds the same key. If
        // it conflicts, the committed row is read back under a row lock. A
        // second round covers the row disappearing in between.
        for _ in 0..2 {
            let reserved = sqlx::query(&format!(
                r"
                INSERT INTO idempotency_keys (business_id, idempotency_key)
                VALUES ($1, $2)
                ON CONFLICT (business_id, idempotency_key) DO NOTHING
                RETURNING {COLUMNS}
                "
            ))
            .bind(business_id)
            .bind(key)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_error)?;

            if let Some(row) = reserved {
                return Ok(LockedKey::Reserved(row_to_record(&row)?));
            }

            let existing = sqlx::query(&format!(
                r"
                SELECT {COLUMNS}
                FROM idempotency_keys
                WHERE business_id = $1 AND idempotency_key = $2
                FOR UPDATE
                "
            ))
            .bind(business_id)
            .bind(key)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_error)?;

            if let Some(row) = existing {
                return Ok(LockedKey::Existing(row_to_record(&row)?));
            }
        }

        Err(StoreError::Database(format!(
            "Could not lock idempotency key {business_id}/{key}"
        )))
    }

    async fn finalize_key(
        &self,
        tx: &mut PgTx,
        business_id: &str,
        key: &str,
        response: &StoredResponse,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE idempotency_keys
            SET resource_id = $3,
                status_code = $4,
                response_body = $5,
                updated_at = now()
            WHERE business_id = $1 AND idempotency_key = $2
            ",
        )
        .bind(business_id)
        .bind(key)
        .bind(&response.resource_id)
        .bind(i32::from(response.status_code))
        .bind(&response.body)
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::InvalidData(format!(
                "idempotency key {business_id}/{key} is not reserved"
            )));
        }
        Ok(())
    }
}

fn row_to_record(row: &PgRow) -> Result<IdempotencyRecord, StoreError> {
    let status_code: Option<i32> = row.try_get("status_code").map_err(db_error)?;
    let status_code = status_code
        .map(|code| {
            u16::try_from(code)
                .map_err(|_| StoreError::InvalidData(format!("Invalid status code: {code}")))
        })
        .transpose()?;

    Ok(IdempotencyRecord {
        business_id: row.try_get("business_id").map_err(db_error)?,
        idempotency_key: row.try_get("idempotency_key").map_err(db_error)?,
        resource_id: row.try_get("resource_id").map_err(db_error)?,
        status_code,
        response_body: row.try_get("response_body").map_err(db_error)?,
        created_at: row.try_get("created_at").map_err(db_error)?,
        updated_at: row.try_get("updated_at").map_err(db_error)?,
    })
}
