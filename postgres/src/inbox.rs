use crate::{PgTx, PostgresStore, db_error};
use relay_core::inbox::InboxStore;
use relay_core::store::{Admission, StoreError};

impl InboxStore for PostgresStore {
    async fn record(
        &self,
        tx: &mut PgTx,
        event_id: &str,
        event_type: &str,
    ) -> Result<Admission<()>, StoreError> {
        // A concurrent insert of the same id waits here for the other
        // transaction, then conflicts if it committed.
        let result = sqlx::query(
            r"
            INSERT INTO inbox_events (event_id, event_type)
            VALUES ($1, $2)
            ON CONFLICT (event_id) DO NOTHING
            ",
        )
        .bind(event_id)
        .bind(event_type)
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            Ok(Admission::Duplicate)
        } else {
            Ok(Admission::Admitted(()))
        }
    }
}
