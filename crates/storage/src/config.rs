use std::time::Duration;

use crate::StorageError;

const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for [`crate::PostgresStorage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl StorageConfig {
    /// Reads `DATABASE_URL`, `DATABASE_MAX_CONNECTIONS` and
    /// `DATABASE_ACQUIRE_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self, StorageError> {
        Self::from_values(
            std::env::var("DATABASE_URL").ok(),
            std::env::var("DATABASE_MAX_CONNECTIONS").ok(),
            std::env::var("DATABASE_ACQUIRE_TIMEOUT_SECS").ok(),
        )
    }

    pub fn from_values(
        database_url: Option<String>,
        max_connections: Option<String>,
        acquire_timeout_secs: Option<String>,
    ) -> Result<Self, StorageError> {
        let database_url = database_url
            .filter(|value| !value.trim().is_empty())
            .ok_or(StorageError::MissingDatabaseUrl)?;

        let max_connections = match max_connections.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_MAX_CONNECTIONS,
            Some(raw) => match raw.parse::<u32>() {
                Ok(value) if value > 0 => value,
                _ => {
                    return Err(StorageError::InvalidConfig(format!(
                        "DATABASE_MAX_CONNECTIONS must be a positive integer, got {raw:?}"
                    )))
                }
            },
        };

        let acquire_timeout = match acquire_timeout_secs.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_ACQUIRE_TIMEOUT,
            Some(raw) => raw.parse::<u64>().map(Duration::from_secs).map_err(|_| {
                StorageError::InvalidConfig(format!(
                    "DATABASE_ACQUIRE_TIMEOUT_SECS must be a whole number of seconds, got {raw:?}"
                ))
            })?,
        };

        Ok(Self {
            database_url,
            max_connections,
            acquire_timeout,
        })
    }
}
