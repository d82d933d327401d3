use roomstore_core::{
    EventNid, EventReference, EventStateKeyNid, RoomNid, StateAtEventAndReference,
    StateSnapshotNid,
};
use sqlx::{Connection, PgConnection, Postgres, Transaction};

use super::events::{select_event_id, select_state_at_event_and_reference};
use super::membership::MembershipTracker;
use super::PostgresStorage;
use crate::StorageError;

/// A session that advances one room's frontier.
///
/// The room row is locked for the lifetime of the session, so concurrent
/// updaters for the same room queue behind each other. The accessors report
/// the frontier as read at open time. Nothing written through the session is
/// visible to other readers until [`FrontierUpdater::commit`]; dropping the
/// session rolls it back.
pub struct FrontierUpdater {
    tx: Transaction<'static, Postgres>,
    room_nid: RoomNid,
    latest_events: Vec<StateAtEventAndReference>,
    last_delivered_event_id: Option<String>,
    current_state_snapshot_nid: StateSnapshotNid,
}

impl PostgresStorage {
    pub async fn begin_frontier_update(
        &self,
        room_nid: RoomNid,
    ) -> Result<FrontierUpdater, StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;

        let (latest_event_nids, last_event_sent_nid, state_snapshot_nid) =
            sqlx::query_as::<_, (Vec<i64>, i64, i64)>(
                r#"
                SELECT latest_event_nids, last_event_sent_nid, state_snapshot_nid
                FROM rooms
                WHERE room_nid = $1
                FOR UPDATE
                "#,
            )
            .bind(room_nid.get())
            .fetch_one(tx.as_mut())
            .await
            .map_err(|error| match error {
                sqlx::Error::RowNotFound => StorageError::RoomNotFound(room_nid),
                _ => StorageError::Database(error.to_string()),
            })?;

        let latest_event_nids: Vec<EventNid> =
            latest_event_nids.into_iter().map(EventNid).collect();
        let latest_events =
            select_state_at_event_and_reference(tx.as_mut(), &latest_event_nids).await?;

        let last_delivered_event_id = match EventNid(last_event_sent_nid) {
            nid if nid.is_zero() => None,
            nid => Some(select_event_id(tx.as_mut(), nid).await?),
        };

        tracing::debug!(
            room_nid = room_nid.get(),
            latest_events = latest_events.len(),
            state_snapshot_nid = state_snapshot_nid,
            "opened frontier update"
        );
        Ok(FrontierUpdater {
            tx,
            room_nid,
            latest_events,
            last_delivered_event_id,
            current_state_snapshot_nid: StateSnapshotNid(state_snapshot_nid),
        })
    }
}

impl FrontierUpdater {
    #[must_use]
    pub fn room_nid(&self) -> RoomNid {
        self.room_nid
    }

    #[must_use]
    pub fn latest_events(&self) -> &[StateAtEventAndReference] {
        &self.latest_events
    }

    #[must_use]
    pub fn last_delivered_event_id(&self) -> Option<&str> {
        self.last_delivered_event_id.as_deref()
    }

    #[must_use]
    pub fn current_state_snapshot_nid(&self) -> StateSnapshotNid {
        self.current_state_snapshot_nid
    }

    /// Records that `event_nid` names each of `previous` as a parent.
    pub async fn store_previous_events(
        &mut self,
        event_nid: EventNid,
        previous: &[EventReference],
    ) -> Result<(), StorageError> {
        for reference in previous {
            sqlx::query(
                r#"
                INSERT INTO previous_events (previous_event_id, previous_reference_sha256, event_nid)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&reference.event_id)
            .bind(&reference.event_sha256)
            .bind(event_nid.get())
            .execute(self.tx.as_mut())
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        }
        Ok(())
    }

    /// Whether any stored event names `reference` as a parent.
    pub async fn is_referenced(&mut self, reference: &EventReference) -> Result<bool, StorageError> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM previous_events
                WHERE previous_event_id = $1 AND previous_reference_sha256 = $2
            )
            "#,
        )
        .bind(&reference.event_id)
        .bind(&reference.event_sha256)
        .fetch_one(self.tx.as_mut())
        .await
        .map_err(|error| StorageError::Database(error.to_string()))
    }

    pub async fn has_event_been_sent(&mut self, event_nid: EventNid) -> Result<bool, StorageError> {
        sqlx::query_scalar::<_, bool>("SELECT sent_to_output FROM events WHERE event_nid = $1")
            .bind(event_nid.get())
            .fetch_one(self.tx.as_mut())
            .await
            .map_err(|error| match error {
                sqlx::Error::RowNotFound => StorageError::EventNidNotFound(event_nid),
                _ => StorageError::Database(error.to_string()),
            })
    }

    pub async fn mark_event_as_sent(&mut self, event_nid: EventNid) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE events SET sent_to_output = TRUE WHERE event_nid = $1")
            .bind(event_nid.get())
            .execute(self.tx.as_mut())
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::EventNidNotFound(event_nid));
        }
        Ok(())
    }

    /// Replaces the stored frontier as a whole.
    ///
    /// `last_event_nid_sent` is zero or any event stored for this room;
    /// delivery may lag several frontier moves behind.
    pub async fn set_latest_events(
        &mut self,
        room_nid: RoomNid,
        latest: &[StateAtEventAndReference],
        last_event_nid_sent: EventNid,
        current_state_snapshot_nid: StateSnapshotNid,
    ) -> Result<(), StorageError> {
        if room_nid != self.room_nid {
            return Err(StorageError::InvalidFrontier(format!(
                "session is for room {} but update names room {room_nid}",
                self.room_nid
            )));
        }
        if !last_event_nid_sent.is_zero() {
            let in_room = sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS (SELECT 1 FROM events WHERE event_nid = $1 AND room_nid = $2)",
            )
            .bind(last_event_nid_sent.get())
            .bind(room_nid.get())
            .fetch_one(self.tx.as_mut())
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
            if !in_room {
                return Err(StorageError::InvalidFrontier(format!(
                    "last sent event {last_event_nid_sent} is not in room {room_nid}"
                )));
            }
        }

        let latest_event_nids: Vec<i64> =
            latest.iter().map(|event| event.event_nid().get()).collect();
        sqlx::query(
            r#"
            UPDATE rooms
            SET latest_event_nids = $2, last_event_sent_nid = $3, state_snapshot_nid = $4
            WHERE room_nid = $1
            "#,
        )
        .bind(room_nid.get())
        .bind(&latest_event_nids)
        .bind(last_event_nid_sent.get())
        .bind(current_state_snapshot_nid.get())
        .execute(self.tx.as_mut())
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;

        tracing::debug!(
            room_nid = room_nid.get(),
            latest_events = latest_event_nids.len(),
            last_event_nid_sent = last_event_nid_sent.get(),
            state_snapshot_nid = current_state_snapshot_nid.get(),
            "staged frontier"
        );
        Ok(())
    }

    /// Opens a membership tracker for this room inside the frontier's
    /// transaction. Its commit is only durable once the frontier commits.
    pub async fn membership_tracker(
        &mut self,
        target_user_nid: EventStateKeyNid,
    ) -> Result<MembershipTracker<'_>, StorageError> {
        let room_nid = self.room_nid;
        let savepoint = Connection::begin(self.conn())
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        MembershipTracker::open(savepoint, room_nid, target_user_nid).await
    }

    pub async fn commit(self) -> Result<(), StorageError> {
        self.tx
            .commit()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        tracing::debug!(room_nid = self.room_nid.get(), "committed frontier update");
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), StorageError> {
        self.tx
            .rollback()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        tracing::debug!(room_nid = self.room_nid.get(), "rolled back frontier update");
        Ok(())
    }

    fn conn(&mut self) -> &mut PgConnection {
        self.tx.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::LatestEventIds;

    const ROOM: &str = "!abc:example.org";

    /// Stores `create` then `message` and returns both with their state.
    async fn two_events(
        storage: &PostgresStorage,
    ) -> (RoomNid, StateAtEventAndReference, StateAtEventAndReference) {
        let create = state_event("$create", ROOM, "m.room.create", "", 1, &[]);
        let message = message_event("$m1", ROOM, "@alice:example.org", 2, &[&create]);
        let (room_nid, create_state) = storage.store_event(&create, None, &[]).await.expect("store");
        let (_, message_state) = storage.store_event(&message, None, &[]).await.expect("store");
        (
            room_nid,
            StateAtEventAndReference {
                state_at_event: create_state,
                event_reference: create.event_reference(),
            },
            StateAtEventAndReference {
                state_at_event: message_state,
                event_reference: message.event_reference(),
            },
        )
    }

    #[tokio::test]
    async fn fresh_room_has_empty_frontier() {
        let Some(storage) = test_storage().await else {
            return;
        };
        let room_nid = storage.assign_room_nid(ROOM).await.expect("room");
        let updater = storage.begin_frontier_update(room_nid).await.expect("open");
        assert_eq!(updater.room_nid(), room_nid);
        assert!(updater.latest_events().is_empty());
        assert_eq!(updater.last_delivered_event_id(), None);
        assert_eq!(updater.current_state_snapshot_nid(), StateSnapshotNid(0));
        updater.rollback().await.expect("rollback");

        assert!(matches!(
            storage.begin_frontier_update(RoomNid(404)).await,
            Err(StorageError::RoomNotFound(RoomNid(404)))
        ));
    }

    #[tokio::test]
    async fn committed_frontier_is_read_back() {
        let Some(storage) = test_storage().await else {
            return;
        };
        let (room_nid, create, message) = two_events(&storage).await;

        let mut updater = storage.begin_frontier_update(room_nid).await.expect("open");
        updater
            .store_previous_events(message.event_nid(), &[create.event_reference.clone()])
            .await
            .expect("store previous");
        updater
            .store_previous_events(message.event_nid(), &[create.event_reference.clone()])
            .await
            .expect("store previous again");
        assert_eq!(updater.is_referenced(&create.event_reference).await, Ok(true));
        assert_eq!(updater.is_referenced(&message.event_reference).await, Ok(false));

        assert_eq!(updater.has_event_been_sent(message.event_nid()).await, Ok(false));
        updater
            .mark_event_as_sent(message.event_nid())
            .await
            .expect("mark sent");
        assert_eq!(updater.has_event_been_sent(message.event_nid()).await, Ok(true));

        updater
            .set_latest_events(
                room_nid,
                &[message.clone()],
                message.event_nid(),
                StateSnapshotNid(7),
            )
            .await
            .expect("set latest");
        updater.commit().await.expect("commit");

        let updater = storage.begin_frontier_update(room_nid).await.expect("reopen");
        assert_eq!(updater.latest_events(), &[message.clone()]);
        assert_eq!(updater.last_delivered_event_id(), Some("$m1"));
        assert_eq!(updater.current_state_snapshot_nid(), StateSnapshotNid(7));
        drop(updater);

        assert_eq!(
            storage.latest_event_ids(room_nid).await,
            Ok(LatestEventIds {
                references: vec![message.event_reference.clone()],
                state_snapshot_nid: StateSnapshotNid(7),
                max_depth: 2,
            })
        );
    }

    #[tokio::test]
    async fn rolled_back_frontier_is_unchanged() {
        let Some(storage) = test_storage().await else {
            return;
        };
        let (room_nid, create, message) = two_events(&storage).await;

        let mut updater = storage.begin_frontier_update(room_nid).await.expect("open");
        updater
            .set_latest_events(room_nid, &[create.clone()], EventNid(0), StateSnapshotNid(1))
            .await
            .expect("set latest");
        updater.commit().await.expect("commit");
        let committed = storage.latest_event_ids(room_nid).await.expect("latest");

        let mut updater = storage.begin_frontier_update(room_nid).await.expect("open");
        updater
            .set_latest_events(
                room_nid,
                &[message.clone()],
                message.event_nid(),
                StateSnapshotNid(2),
            )
            .await
            .expect("set latest");
        updater
            .mark_event_as_sent(message.event_nid())
            .await
            .expect("mark sent");
        // Staged writes are not visible outside the session.
        assert_eq!(storage.latest_event_ids(room_nid).await, Ok(committed.clone()));
        updater.rollback().await.expect("rollback");
        assert_eq!(storage.latest_event_ids(room_nid).await, Ok(committed.clone()));

        {
            let mut updater = storage.begin_frontier_update(room_nid).await.expect("open");
            updater
                .set_latest_events(room_nid, &[message.clone()], EventNid(0), StateSnapshotNid(3))
                .await
                .expect("set latest");
        }
        assert_eq!(storage.latest_event_ids(room_nid).await, Ok(committed));

        let mut updater = storage.begin_frontier_update(room_nid).await.expect("open");
        assert_eq!(updater.latest_events(), &[create]);
        assert_eq!(updater.last_delivered_event_id(), None);
        assert_eq!(updater.has_event_been_sent(message.event_nid()).await, Ok(false));
    }

    #[tokio::test]
    async fn last_sent_may_lag_behind_the_frontier() {
        let Some(storage) = test_storage().await else {
            return;
        };
        let (room_nid, create, message) = two_events(&storage).await;
        let reply = message_event("$m2", ROOM, "@bob:example.org", 3, &[]);
        let (_, reply_state) = storage.store_event(&reply, None, &[]).await.expect("store");
        let reply = StateAtEventAndReference {
            state_at_event: reply_state,
            event_reference: reply.event_reference(),
        };

        let mut updater = storage.begin_frontier_update(room_nid).await.expect("open");
        updater
            .set_latest_events(room_nid, &[create.clone()], create.event_nid(), StateSnapshotNid(0))
            .await
            .expect("first frontier");
        updater.commit().await.expect("commit");

        let mut updater = storage.begin_frontier_update(room_nid).await.expect("open");
        updater
            .set_latest_events(room_nid, &[message.clone()], create.event_nid(), StateSnapshotNid(0))
            .await
            .expect("second frontier");
        updater.commit().await.expect("commit");

        // Delivery is still two frontier moves behind.
        let mut updater = storage.begin_frontier_update(room_nid).await.expect("open");
        updater
            .set_latest_events(room_nid, &[reply.clone()], create.event_nid(), StateSnapshotNid(0))
            .await
            .expect("lagging last sent");
        updater.commit().await.expect("commit");

        let updater = storage.begin_frontier_update(room_nid).await.expect("reopen");
        assert_eq!(updater.latest_events(), &[reply]);
        assert_eq!(updater.last_delivered_event_id(), Some("$create"));
    }

    #[tokio::test]
    async fn last_sent_must_belong_to_the_room() {
        let Some(storage) = test_storage().await else {
            return;
        };
        let (room_nid, _, message) = two_events(&storage).await;
        let elsewhere = message_event("$other", "!other:example.org", "@bob:example.org", 1, &[]);
        let (_, elsewhere_state) = storage.store_event(&elsewhere, None, &[]).await.expect("store");

        let mut updater = storage.begin_frontier_update(room_nid).await.expect("open");
        assert!(matches!(
            updater
                .set_latest_events(
                    room_nid,
                    &[message.clone()],
                    elsewhere_state.event_nid(),
                    StateSnapshotNid(0)
                )
                .await,
            Err(StorageError::InvalidFrontier(_))
        ));
        assert!(matches!(
            updater
                .set_latest_events(RoomNid(404), &[message.clone()], EventNid(0), StateSnapshotNid(0))
                .await,
            Err(StorageError::InvalidFrontier(_))
        ));
        assert_eq!(
            updater.has_event_been_sent(EventNid(404)).await,
            Err(StorageError::EventNidNotFound(EventNid(404)))
        );
    }

    #[tokio::test]
    async fn nested_membership_follows_the_frontier() {
        let Some(storage) = test_storage().await else {
            return;
        };
        let join = member_event("$join", ROOM, "@alice:example.org", "@alice:example.org", "join", 1, &[]);
        let (room_nid, join_state) = storage.store_event(&join, None, &[]).await.expect("store");
        let alice_nid = join_state.state_entry.state_key_tuple.event_state_key_nid;

        let mut updater = storage.begin_frontier_update(room_nid).await.expect("open");
        let mut tracker = updater.membership_tracker(alice_nid).await.expect("tracker");
        tracker
            .set_to_join("@alice:example.org", "$join", false)
            .await
            .expect("join");
        tracker.commit().await.expect("release savepoint");
        updater.rollback().await.expect("rollback frontier");

        let lookup = storage
            .get_membership(room_nid, "@alice:example.org")
            .await
            .expect("lookup");
        assert!(!lookup.still_in_room);

        let mut updater = storage.begin_frontier_update(room_nid).await.expect("open");
        let mut tracker = updater.membership_tracker(alice_nid).await.expect("tracker");
        assert!(!tracker.is_join());
        tracker
            .set_to_join("@alice:example.org", "$join", false)
            .await
            .expect("join");
        tracker.commit().await.expect("release savepoint");
        updater.commit().await.expect("commit frontier");

        assert_eq!(
            storage.get_membership(room_nid, "@alice:example.org").await,
            Ok(crate::MembershipLookup {
                event_nid: join_state.event_nid(),
                still_in_room: true,
            })
        );
    }
}
