use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use roomstore_core::{
    Event, EventNid, EventReference, EventStateKeyNid, EventTypeNid, RoomNid, StateAtEvent,
    StateAtEventAndReference, StateEntry, StateKeyTuple, StateSnapshotNid, StoredEvent,
    TransactionId,
};
use sqlx::PgConnection;

use super::nids::assign_event_state_key_nid;
use super::transactions::insert_transaction;
use super::{nid_values, PostgresStorage};
use crate::{EventStorage, IdentifierStorage, LatestEventIds, StorageError};

#[async_trait]
impl EventStorage for PostgresStorage {
    async fn store_event(
        &self,
        event: &Event,
        transaction: Option<&TransactionId>,
        auth_event_nids: &[EventNid],
    ) -> Result<(RoomNid, StateAtEvent), StorageError> {
        // Recorded ahead of the event itself; a resubmission that arrives
        // while the event is still being stored may miss it.
        if let Some(transaction) = transaction {
            insert_transaction(&self.pool, transaction, event.sender(), event.event_id()).await?;
        }

        // Interning commits on its own so a failure below leaves the NIDs in place.
        let room_nid = self.assign_room_nid(event.room_id()).await?;
        let event_type_nid = self.assign_event_type_nid(event.event_type()).await?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;

        let event_state_key_nid = match event.state_key() {
            Some(state_key) => assign_event_state_key_nid(tx.as_mut(), state_key).await?,
            None => EventStateKeyNid::NONE,
        };

        let inserted = sqlx::query_as::<_, (i64, i64)>(
            r#"
            INSERT INTO events (
                room_nid, event_type_nid, event_state_key_nid, event_id,
                reference_sha256, auth_event_nids, depth
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING event_nid, state_snapshot_nid
            "#,
        )
        .bind(room_nid.get())
        .bind(event_type_nid.get())
        .bind(event_state_key_nid.get())
        .bind(event.event_id())
        .bind(event.reference_sha256())
        .bind(nid_values(auth_event_nids, EventNid::get))
        .bind(event.depth())
        .fetch_optional(tx.as_mut())
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;

        let (event_nid, state_snapshot_nid) = match inserted {
            Some(row) => row,
            None => {
                tracing::debug!(event_id = event.event_id(), "event already stored");
                sqlx::query_as::<_, (i64, i64)>(
                    "SELECT event_nid, state_snapshot_nid FROM events WHERE event_id = $1",
                )
                .bind(event.event_id())
                .fetch_optional(tx.as_mut())
                .await
                .map_err(|error| StorageError::Database(error.to_string()))?
                .ok_or_else(|| StorageError::DuplicateKey {
                    table: "events",
                    key: event.event_id().to_owned(),
                })?
            }
        };

        sqlx::query(
            r#"
            INSERT INTO event_json (event_nid, event_json)
            VALUES ($1, $2)
            ON CONFLICT (event_nid) DO NOTHING
            "#,
        )
        .bind(event_nid)
        .bind(event.json())
        .execute(tx.as_mut())
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;

        tx.commit()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;

        Ok((
            room_nid,
            StateAtEvent {
                before_state_snapshot_nid: StateSnapshotNid(state_snapshot_nid),
                state_entry: StateEntry::new(
                    StateKeyTuple::new(event_type_nid, event_state_key_nid),
                    EventNid(event_nid),
                ),
            },
        ))
    }

    async fn events(&self, event_nids: &[EventNid]) -> Result<Vec<StoredEvent>, StorageError> {
        let rows = sqlx::query_as::<_, (i64, String)>(
            r#"
            SELECT event_nid, event_json
            FROM event_json
            WHERE event_nid = ANY($1)
            ORDER BY event_nid ASC
            "#,
        )
        .bind(nid_values(event_nids, EventNid::get))
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;

        rows.into_iter()
            .map(|(event_nid, json)| {
                let event_nid = EventNid(event_nid);
                let event = Event::from_json(json.as_bytes()).map_err(|error| {
                    StorageError::CorruptEvent {
                        event_nid,
                        reason: error.to_string(),
                    }
                })?;
                Ok(StoredEvent { event_nid, event })
            })
            .collect()
    }

    async fn events_from_ids(&self, event_ids: &[String]) -> Result<Vec<StoredEvent>, StorageError> {
        let nids: Vec<EventNid> = self.event_nids(event_ids).await?.into_values().collect();
        self.events(&nids).await
    }

    async fn event_nids(
        &self,
        event_ids: &[String],
    ) -> Result<HashMap<String, EventNid>, StorageError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT event_id, event_nid FROM events WHERE event_id = ANY($1)",
        )
        .bind(event_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(event_id, nid)| (event_id, EventNid(nid)))
            .collect())
    }

    async fn event_ids(
        &self,
        event_nids: &[EventNid],
    ) -> Result<HashMap<EventNid, String>, StorageError> {
        let rows = sqlx::query_as::<_, (i64, String)>(
            "SELECT event_nid, event_id FROM events WHERE event_nid = ANY($1)",
        )
        .bind(nid_values(event_nids, EventNid::get))
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(nid, event_id)| (EventNid(nid), event_id))
            .collect())
    }

    async fn state_entries_for_event_ids(
        &self,
        event_ids: &[String],
    ) -> Result<Vec<StateEntry>, StorageError> {
        let rows = sqlx::query_as::<_, StateAtEventRow>(
            r#"
            SELECT event_id, event_nid, event_type_nid, event_state_key_nid, state_snapshot_nid
            FROM events
            WHERE event_id = ANY($1)
            "#,
        )
        .bind(event_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;

        let found: HashSet<&str> = rows.iter().map(|row| row.event_id.as_str()).collect();
        if let Some(missing) = event_ids.iter().find(|id| !found.contains(id.as_str())) {
            return Err(StorageError::MissingEvent(missing.clone()));
        }

        let mut entries: Vec<StateEntry> = rows.iter().map(StateAtEventRow::state_entry).collect();
        entries.sort();
        Ok(entries)
    }

    async fn state_at_event_ids(
        &self,
        event_ids: &[String],
    ) -> Result<Vec<StateAtEvent>, StorageError> {
        let rows = sqlx::query_as::<_, StateAtEventRow>(
            r#"
            SELECT event_id, event_nid, event_type_nid, event_state_key_nid, state_snapshot_nid
            FROM events
            WHERE event_id = ANY($1)
            "#,
        )
        .bind(event_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;

        let by_id: HashMap<&str, &StateAtEventRow> = rows
            .iter()
            .map(|row| (row.event_id.as_str(), row))
            .collect();

        event_ids
            .iter()
            .map(|event_id| {
                let row = by_id
                    .get(event_id.as_str())
                    .ok_or_else(|| StorageError::MissingEvent(event_id.clone()))?;
                if row.state_snapshot_nid == 0 {
                    return Err(StorageError::MissingState(event_id.clone()));
                }
                Ok(row.state_at_event())
            })
            .collect()
    }

    async fn set_state(
        &self,
        event_nid: EventNid,
        state_snapshot_nid: StateSnapshotNid,
    ) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE events SET state_snapshot_nid = $2 WHERE event_nid = $1")
            .bind(event_nid.get())
            .bind(state_snapshot_nid.get())
            .execute(&self.pool)
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::EventNidNotFound(event_nid));
        }
        Ok(())
    }

    async fn snapshot_nid_from_event_id(
        &self,
        event_id: &str,
    ) -> Result<StateSnapshotNid, StorageError> {
        let nid: Option<i64> =
            sqlx::query_scalar("SELECT state_snapshot_nid FROM events WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|error| StorageError::Database(error.to_string()))?;
        nid.map(StateSnapshotNid)
            .ok_or_else(|| StorageError::MissingEvent(event_id.to_owned()))
    }

    async fn latest_event_ids(&self, room_nid: RoomNid) -> Result<LatestEventIds, StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(tx.as_mut())
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;

        let (latest_event_nids, state_snapshot_nid) = sqlx::query_as::<_, (Vec<i64>, i64)>(
            "SELECT latest_event_nids, state_snapshot_nid FROM rooms WHERE room_nid = $1",
        )
        .bind(room_nid.get())
        .fetch_one(tx.as_mut())
        .await
        .map_err(|error| match error {
            sqlx::Error::RowNotFound => StorageError::RoomNotFound(room_nid),
            _ => StorageError::Database(error.to_string()),
        })?;

        let references = sqlx::query_as::<_, (String, Vec<u8>)>(
            r#"
            SELECT event_id, reference_sha256
            FROM events
            WHERE event_nid = ANY($1)
            ORDER BY event_nid ASC
            "#,
        )
        .bind(&latest_event_nids)
        .fetch_all(tx.as_mut())
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?
        .into_iter()
        .map(|(event_id, event_sha256)| EventReference {
            event_id,
            event_sha256,
        })
        .collect();

        let max_depth: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(depth), 0)::BIGINT FROM events WHERE event_nid = ANY($1)",
        )
        .bind(&latest_event_nids)
        .fetch_one(tx.as_mut())
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;

        tx.commit()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;

        Ok(LatestEventIds {
            references,
            state_snapshot_nid: StateSnapshotNid(state_snapshot_nid),
            max_depth,
        })
    }
}

// ---------------------------------------------------------------------------
// Connection-level helpers shared with the frontier and membership sessions
// ---------------------------------------------------------------------------

/// Loads the state and reference of each event, in request order.
pub(crate) async fn select_state_at_event_and_reference(
    conn: &mut PgConnection,
    event_nids: &[EventNid],
) -> Result<Vec<StateAtEventAndReference>, StorageError> {
    let rows = sqlx::query_as::<_, StateAtEventAndReferenceRow>(
        r#"
        SELECT event_nid, event_type_nid, event_state_key_nid, state_snapshot_nid,
               event_id, reference_sha256
        FROM events
        WHERE event_nid = ANY($1)
        "#,
    )
    .bind(nid_values(event_nids, EventNid::get))
    .fetch_all(conn)
    .await
    .map_err(|error| StorageError::Database(error.to_string()))?;

    let mut by_nid: HashMap<i64, StateAtEventAndReferenceRow> =
        rows.into_iter().map(|row| (row.event_nid, row)).collect();

    event_nids
        .iter()
        .map(|nid| {
            let row = by_nid
                .remove(&nid.get())
                .ok_or(StorageError::EventNidNotFound(*nid))?;
            Ok(StateAtEventAndReference {
                state_at_event: StateAtEvent {
                    before_state_snapshot_nid: StateSnapshotNid(row.state_snapshot_nid),
                    state_entry: StateEntry::new(
                        StateKeyTuple::new(
                            EventTypeNid(row.event_type_nid),
                            EventStateKeyNid(row.event_state_key_nid),
                        ),
                        EventNid(row.event_nid),
                    ),
                },
                event_reference: EventReference {
                    event_id: row.event_id,
                    event_sha256: row.reference_sha256,
                },
            })
        })
        .collect()
}

pub(crate) async fn select_event_id(
    conn: &mut PgConnection,
    event_nid: EventNid,
) -> Result<String, StorageError> {
    sqlx::query_scalar("SELECT event_id FROM events WHERE event_nid = $1")
        .bind(event_nid.get())
        .fetch_one(conn)
        .await
        .map_err(|error| match error {
            sqlx::Error::RowNotFound => StorageError::EventNidNotFound(event_nid),
            _ => StorageError::Database(error.to_string()),
        })
}

pub(crate) async fn select_event_nid(
    conn: &mut PgConnection,
    event_id: &str,
) -> Result<EventNid, StorageError> {
    let nid: Option<i64> = sqlx::query_scalar("SELECT event_nid FROM events WHERE event_id = $1")
        .bind(event_id)
        .fetch_optional(conn)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
    nid.map(EventNid)
        .ok_or_else(|| StorageError::MissingEvent(event_id.to_owned()))
}

#[derive(Debug, sqlx::FromRow)]
struct StateAtEventRow {
    event_id: String,
    event_nid: i64,
    event_type_nid: i64,
    event_state_key_nid: i64,
    state_snapshot_nid: i64,
}

impl StateAtEventRow {
    fn state_entry(&self) -> StateEntry {
        StateEntry::new(
            StateKeyTuple::new(
                EventTypeNid(self.event_type_nid),
                EventStateKeyNid(self.event_state_key_nid),
            ),
            EventNid(self.event_nid),
        )
    }

    fn state_at_event(&self) -> StateAtEvent {
        StateAtEvent {
            before_state_snapshot_nid: StateSnapshotNid(self.state_snapshot_nid),
            state_entry: self.state_entry(),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StateAtEventAndReferenceRow {
    event_nid: i64,
    event_type_nid: i64,
    event_state_key_nid: i64,
    state_snapshot_nid: i64,
    event_id: String,
    reference_sha256: Vec<u8>,
}
