use async_trait::async_trait;

use super::{is_unique_violation, PostgresStorage};
use crate::{AliasStorage, StorageError};

#[async_trait]
impl AliasStorage for PostgresStorage {
    async fn set_room_alias(
        &self,
        alias: &str,
        room_id: &str,
        creator_user_id: &str,
    ) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO room_aliases (alias, room_id, creator_id) VALUES ($1, $2, $3)")
            .bind(alias)
            .bind(room_id)
            .bind(creator_user_id)
            .execute(&self.pool)
            .await
            .map_err(|error| {
                if is_unique_violation(&error) {
                    StorageError::AliasExists(alias.to_owned())
                } else {
                    StorageError::Database(error.to_string())
                }
            })?;
        tracing::debug!(alias, room_id, "set room alias");
        Ok(())
    }

    async fn room_id_for_alias(&self, alias: &str) -> Result<Option<String>, StorageError> {
        sqlx::query_scalar::<_, String>("SELECT room_id FROM room_aliases WHERE alias = $1")
            .bind(alias)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StorageError::Database(error.to_string()))
    }

    async fn aliases_for_room_id(&self, room_id: &str) -> Result<Vec<String>, StorageError> {
        sqlx::query_scalar::<_, String>(
            "SELECT alias FROM room_aliases WHERE room_id = $1 ORDER BY alias ASC",
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))
    }

    async fn creator_id_for_alias(&self, alias: &str) -> Result<Option<String>, StorageError> {
        sqlx::query_scalar::<_, String>("SELECT creator_id FROM room_aliases WHERE alias = $1")
            .bind(alias)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StorageError::Database(error.to_string()))
    }

    async fn remove_room_alias(&self, alias: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM room_aliases WHERE alias = $1")
            .bind(alias)
            .execute(&self.pool)
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        Ok(())
    }
}
