use async_trait::async_trait;
use roomstore_core::TransactionId;
use sqlx::PgPool;

use super::PostgresStorage;
use crate::{StorageError, TransactionStorage};

/// Remembers which event a client transaction produced. Re-recording the same
/// transaction keeps the first event id.
pub(crate) async fn insert_transaction(
    pool: &PgPool,
    transaction: &TransactionId,
    user_id: &str,
    event_id: &str,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO transactions (transaction_id, session_id, user_id, event_id)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (transaction_id, session_id, user_id) DO NOTHING
        "#,
    )
    .bind(&transaction.transaction_id)
    .bind(transaction.session_id)
    .bind(user_id)
    .bind(event_id)
    .execute(pool)
    .await
    .map_err(|error| StorageError::Database(error.to_string()))?;
    Ok(())
}

#[async_trait]
impl TransactionStorage for PostgresStorage {
    async fn transaction_event_id(
        &self,
        transaction: &TransactionId,
        user_id: &str,
    ) -> Result<Option<String>, StorageError> {
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT event_id FROM transactions
            WHERE transaction_id = $1 AND session_id = $2 AND user_id = $3
            "#,
        )
        .bind(&transaction.transaction_id)
        .bind(transaction.session_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))
    }
}
