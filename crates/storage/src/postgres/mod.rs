#![forbid(unsafe_code)]

mod aliases;
mod events;
mod frontier;
mod membership;
mod nids;
mod state;
mod transactions;

#[cfg(test)]
mod test_support;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::{StorageConfig, StorageError};

pub use frontier::FrontierUpdater;
pub use membership::MembershipTracker;

#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        Ok(Self { pool })
    }

    pub async fn connect_with(config: &StorageConfig) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

// ---------------------------------------------------------------------------
// Shared helpers used across multiple domain modules
// ---------------------------------------------------------------------------

pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db_error) if db_error.code().as_deref() == Some("23505")
    )
}

pub(crate) fn nid_values<T, F>(nids: &[T], get: F) -> Vec<i64>
where
    T: Copy,
    F: Fn(T) -> i64,
{
    nids.iter().map(|nid| get(*nid)).collect()
}
