use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use roomstore_core::{
    EventNid, EventStateKeyNid, EventTypeNid, RoomNid, StateBlockNid, StateBlockNidList,
    StateEntry, StateEntryList, StateKeyTuple, StateSnapshotNid,
};

use super::{nid_values, PostgresStorage};
use crate::{StateStorage, StorageError};

#[async_trait]
impl StateStorage for PostgresStorage {
    async fn add_state(
        &self,
        room_nid: RoomNid,
        state_block_nids: &[StateBlockNid],
        state: &[StateEntry],
    ) -> Result<StateSnapshotNid, StorageError> {
        let mut entries = state.to_vec();
        entries.sort();
        if let Some(pair) = entries
            .windows(2)
            .find(|pair| pair[0].state_key_tuple == pair[1].state_key_tuple)
        {
            return Err(StorageError::DuplicateStateEntry(pair[0].state_key_tuple));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;

        let mut block_nids = nid_values(state_block_nids, StateBlockNid::get);
        if !entries.is_empty() {
            let state_block_nid: i64 = sqlx::query_scalar("SELECT nextval('state_block_nid_seq')")
                .fetch_one(tx.as_mut())
                .await
                .map_err(|error| StorageError::Database(error.to_string()))?;

            let type_nids: Vec<i64> = entries
                .iter()
                .map(|entry| entry.state_key_tuple.event_type_nid.get())
                .collect();
            let state_key_nids: Vec<i64> = entries
                .iter()
                .map(|entry| entry.state_key_tuple.event_state_key_nid.get())
                .collect();
            let event_nids: Vec<i64> = entries.iter().map(|entry| entry.event_nid.get()).collect();

            sqlx::query(
                r#"
                INSERT INTO state_block (state_block_nid, event_type_nid, event_state_key_nid, event_nid)
                SELECT $1, entry.event_type_nid, entry.event_state_key_nid, entry.event_nid
                FROM UNNEST($2::BIGINT[], $3::BIGINT[], $4::BIGINT[])
                    AS entry (event_type_nid, event_state_key_nid, event_nid)
                "#,
            )
            .bind(state_block_nid)
            .bind(&type_nids)
            .bind(&state_key_nids)
            .bind(&event_nids)
            .execute(tx.as_mut())
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;

            block_nids.push(state_block_nid);
        }

        let state_snapshot_nid: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO state_snapshots (room_nid, state_block_nids)
            VALUES ($1, $2)
            RETURNING state_snapshot_nid
            "#,
        )
        .bind(room_nid.get())
        .bind(&block_nids)
        .fetch_one(tx.as_mut())
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;

        tx.commit()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;

        tracing::debug!(
            room_nid = room_nid.get(),
            state_snapshot_nid,
            blocks = block_nids.len(),
            new_entries = entries.len(),
            "stored state snapshot"
        );
        Ok(StateSnapshotNid(state_snapshot_nid))
    }

    async fn state_block_nids(
        &self,
        state_snapshot_nids: &[StateSnapshotNid],
    ) -> Result<Vec<StateBlockNidList>, StorageError> {
        let rows = sqlx::query_as::<_, (i64, Vec<i64>)>(
            r#"
            SELECT state_snapshot_nid, state_block_nids
            FROM state_snapshots
            WHERE state_snapshot_nid = ANY($1)
            "#,
        )
        .bind(nid_values(state_snapshot_nids, StateSnapshotNid::get))
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;

        let by_nid: HashMap<i64, Vec<i64>> = rows.into_iter().collect();
        state_snapshot_nids
            .iter()
            .map(|nid| {
                let blocks = by_nid
                    .get(&nid.get())
                    .ok_or(StorageError::StateSnapshotNotFound(*nid))?;
                Ok(StateBlockNidList {
                    state_snapshot_nid: *nid,
                    state_block_nids: blocks.iter().copied().map(StateBlockNid).collect(),
                })
            })
            .collect()
    }

    async fn state_entries(
        &self,
        state_block_nids: &[StateBlockNid],
    ) -> Result<Vec<StateEntryList>, StorageError> {
        let blocks = self.select_state_blocks(state_block_nids).await?;
        state_block_nids
            .iter()
            .map(|nid| {
                let entries = blocks
                    .get(&nid.get())
                    .ok_or(StorageError::StateBlockNotFound(*nid))?;
                Ok(StateEntryList {
                    state_block_nid: *nid,
                    state_entries: entries.clone(),
                })
            })
            .collect()
    }

    async fn state_entries_for_tuples(
        &self,
        state_block_nids: &[StateBlockNid],
        state_key_tuples: &[StateKeyTuple],
    ) -> Result<Vec<StateEntryList>, StorageError> {
        let wanted: HashSet<StateKeyTuple> = state_key_tuples.iter().copied().collect();
        let type_nids: Vec<i64> = state_key_tuples
            .iter()
            .map(|tuple| tuple.event_type_nid.get())
            .collect();
        let state_key_nids: Vec<i64> = state_key_tuples
            .iter()
            .map(|tuple| tuple.event_state_key_nid.get())
            .collect();

        // Matching each column separately over-selects; the exact pairs are
        // filtered below.
        let rows = sqlx::query_as::<_, StateBlockRow>(
            r#"
            SELECT state_block_nid, event_type_nid, event_state_key_nid, event_nid
            FROM state_block
            WHERE state_block_nid = ANY($1)
              AND event_type_nid = ANY($2)
              AND event_state_key_nid = ANY($3)
            ORDER BY state_block_nid, event_type_nid, event_state_key_nid
            "#,
        )
        .bind(nid_values(state_block_nids, StateBlockNid::get))
        .bind(&type_nids)
        .bind(&state_key_nids)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;

        let mut blocks: HashMap<i64, Vec<StateEntry>> = HashMap::new();
        for row in rows {
            let entry = row.entry();
            if wanted.contains(&entry.state_key_tuple) {
                blocks.entry(row.state_block_nid).or_default().push(entry);
            }
        }

        Ok(state_block_nids
            .iter()
            .map(|nid| StateEntryList {
                state_block_nid: *nid,
                state_entries: blocks.get(&nid.get()).cloned().unwrap_or_default(),
            })
            .collect())
    }
}

impl PostgresStorage {
    async fn select_state_blocks(
        &self,
        state_block_nids: &[StateBlockNid],
    ) -> Result<BTreeMap<i64, Vec<StateEntry>>, StorageError> {
        let rows = sqlx::query_as::<_, StateBlockRow>(
            r#"
            SELECT state_block_nid, event_type_nid, event_state_key_nid, event_nid
            FROM state_block
            WHERE state_block_nid = ANY($1)
            ORDER BY state_block_nid, event_type_nid, event_state_key_nid
            "#,
        )
        .bind(nid_values(state_block_nids, StateBlockNid::get))
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;

        let mut blocks: BTreeMap<i64, Vec<StateEntry>> = BTreeMap::new();
        for row in rows {
            blocks.entry(row.state_block_nid).or_default().push(row.entry());
        }
        Ok(blocks)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StateBlockRow {
    state_block_nid: i64,
    event_type_nid: i64,
    event_state_key_nid: i64,
    event_nid: i64,
}

impl StateBlockRow {
    fn entry(&self) -> StateEntry {
        StateEntry::new(
            StateKeyTuple::new(
                EventTypeNid(self.event_type_nid),
                EventStateKeyNid(self.event_state_key_nid),
            ),
            EventNid(self.event_nid),
        )
    }
}
