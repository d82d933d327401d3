use std::collections::HashMap;

use async_trait::async_trait;
use roomstore_core::{EventStateKeyNid, EventTypeNid, RoomNid};
use sqlx::PgConnection;

use super::{nid_values, PostgresStorage};
use crate::{IdentifierStorage, StorageError};

/// A string-to-NID interning table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NidTable {
    Room,
    EventType,
    EventStateKey,
}

impl NidTable {
    pub(crate) const fn name(self) -> &'static str {
        match self {
            Self::Room => "rooms",
            Self::EventType => "event_types",
            Self::EventStateKey => "event_state_keys",
        }
    }

    const fn select_sql(self) -> &'static str {
        match self {
            Self::Room => "SELECT room_nid FROM rooms WHERE room_id = $1",
            Self::EventType => "SELECT event_type_nid FROM event_types WHERE event_type = $1",
            Self::EventStateKey => {
                "SELECT event_state_key_nid FROM event_state_keys WHERE event_state_key = $1"
            }
        }
    }

    // A concurrent insert of the same key makes these return no row instead of failing.
    const fn insert_sql(self) -> &'static str {
        match self {
            Self::Room => {
                "INSERT INTO rooms (room_id) VALUES ($1) ON CONFLICT (room_id) DO NOTHING RETURNING room_nid"
            }
            Self::EventType => {
                "INSERT INTO event_types (event_type) VALUES ($1) ON CONFLICT (event_type) DO NOTHING RETURNING event_type_nid"
            }
            Self::EventStateKey => {
                "INSERT INTO event_state_keys (event_state_key) VALUES ($1) ON CONFLICT (event_state_key) DO NOTHING RETURNING event_state_key_nid"
            }
        }
    }
}

/// The two halves of an intern operation.
///
/// `insert` returns `Ok(None)` when a concurrent writer won the uniqueness
/// race, which is distinct from an error.
#[async_trait]
pub(crate) trait InsertOrSelect: Send {
    type Output: Send;

    async fn select(&mut self) -> Result<Option<Self::Output>, StorageError>;
    async fn insert(&mut self) -> Result<Option<Self::Output>, StorageError>;
    fn table(&self) -> &'static str;
    fn key(&self) -> String;
}

/// Select, insert if absent, and reselect once if the insert lost a race.
/// Losing twice is reported as [`StorageError::DuplicateKey`].
pub(crate) async fn select_insert_reselect<O>(op: &mut O) -> Result<O::Output, StorageError>
where
    O: InsertOrSelect,
{
    if let Some(existing) = op.select().await? {
        return Ok(existing);
    }
    if let Some(inserted) = op.insert().await? {
        return Ok(inserted);
    }

    tracing::debug!(table = op.table(), key = %op.key(), "lost insert race, reselecting");
    match op.select().await? {
        Some(existing) => Ok(existing),
        None => {
            tracing::warn!(table = op.table(), key = %op.key(), "insert race lost twice");
            Err(StorageError::DuplicateKey {
                table: op.table(),
                key: op.key(),
            })
        }
    }
}

struct AssignNid<'c> {
    conn: &'c mut PgConnection,
    table: NidTable,
    key: &'c str,
}

#[async_trait]
impl<'c> InsertOrSelect for AssignNid<'c> {
    type Output = i64;

    async fn select(&mut self) -> Result<Option<i64>, StorageError> {
        sqlx::query_scalar::<_, i64>(self.table.select_sql())
            .bind(self.key)
            .fetch_optional(&mut *self.conn)
            .await
            .map_err(|error| StorageError::Database(error.to_string()))
    }

    async fn insert(&mut self) -> Result<Option<i64>, StorageError> {
        sqlx::query_scalar::<_, i64>(self.table.insert_sql())
            .bind(self.key)
            .fetch_optional(&mut *self.conn)
            .await
            .map_err(|error| StorageError::Database(error.to_string()))
    }

    fn table(&self) -> &'static str {
        self.table.name()
    }

    fn key(&self) -> String {
        self.key.to_owned()
    }
}

/// Interns `key` in `table` on the given connection or transaction.
pub(crate) async fn assign_nid(
    conn: &mut PgConnection,
    table: NidTable,
    key: &str,
) -> Result<i64, StorageError> {
    select_insert_reselect(&mut AssignNid { conn, table, key }).await
}

pub(crate) async fn assign_room_nid(
    conn: &mut PgConnection,
    room_id: &str,
) -> Result<RoomNid, StorageError> {
    assign_nid(conn, NidTable::Room, room_id).await.map(RoomNid)
}

pub(crate) async fn assign_event_type_nid(
    conn: &mut PgConnection,
    event_type: &str,
) -> Result<EventTypeNid, StorageError> {
    assign_nid(conn, NidTable::EventType, event_type)
        .await
        .map(EventTypeNid)
}

pub(crate) async fn assign_event_state_key_nid(
    conn: &mut PgConnection,
    event_state_key: &str,
) -> Result<EventStateKeyNid, StorageError> {
    assign_nid(conn, NidTable::EventStateKey, event_state_key)
        .await
        .map(EventStateKeyNid)
}

pub(crate) async fn select_event_state_key_nid(
    conn: &mut PgConnection,
    event_state_key: &str,
) -> Result<Option<EventStateKeyNid>, StorageError> {
    let nid: Option<i64> = sqlx::query_scalar(NidTable::EventStateKey.select_sql())
        .bind(event_state_key)
        .fetch_optional(conn)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
    Ok(nid.map(EventStateKeyNid))
}

impl PostgresStorage {
    /// Runs one intern operation in its own transaction.
    async fn assign_in_transaction(&self, table: NidTable, key: &str) -> Result<i64, StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        let nid = assign_nid(tx.as_mut(), table, key).await?;
        tx.commit()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        Ok(nid)
    }
}

#[async_trait]
impl IdentifierStorage for PostgresStorage {
    async fn assign_room_nid(&self, room_id: &str) -> Result<RoomNid, StorageError> {
        self.assign_in_transaction(NidTable::Room, room_id)
            .await
            .map(RoomNid)
    }

    async fn assign_event_type_nid(&self, event_type: &str) -> Result<EventTypeNid, StorageError> {
        self.assign_in_transaction(NidTable::EventType, event_type)
            .await
            .map(EventTypeNid)
    }

    async fn assign_event_state_key_nid(
        &self,
        event_state_key: &str,
    ) -> Result<EventStateKeyNid, StorageError> {
        self.assign_in_transaction(NidTable::EventStateKey, event_state_key)
            .await
            .map(EventStateKeyNid)
    }

    async fn room_nid(&self, room_id: &str) -> Result<Option<RoomNid>, StorageError> {
        let nid: Option<i64> = sqlx::query_scalar(NidTable::Room.select_sql())
            .bind(room_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        Ok(nid.map(RoomNid))
    }

    async fn event_type_nids(
        &self,
        event_types: &[String],
    ) -> Result<HashMap<String, EventTypeNid>, StorageError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT event_type, event_type_nid FROM event_types WHERE event_type = ANY($1)",
        )
        .bind(event_types)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(event_type, nid)| (event_type, EventTypeNid(nid)))
            .collect())
    }

    async fn event_state_key_nids(
        &self,
        event_state_keys: &[String],
    ) -> Result<HashMap<String, EventStateKeyNid>, StorageError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT event_state_key, event_state_key_nid
            FROM event_state_keys
            WHERE event_state_key = ANY($1)
            "#,
        )
        .bind(event_state_keys)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(key, nid)| (key, EventStateKeyNid(nid)))
            .collect())
    }

    async fn event_state_keys(
        &self,
        event_state_key_nids: &[EventStateKeyNid],
    ) -> Result<HashMap<EventStateKeyNid, String>, StorageError> {
        let rows = sqlx::query_as::<_, (i64, String)>(
            r#"
            SELECT event_state_key_nid, event_state_key
            FROM event_state_keys
            WHERE event_state_key_nid = ANY($1)
            "#,
        )
        .bind(nid_values(event_state_key_nids, EventStateKeyNid::get))
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(nid, key)| (EventStateKeyNid(nid), key))
            .collect())
    }
}
