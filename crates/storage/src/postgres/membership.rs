use async_trait::async_trait;
use roomstore_core::{Event, EventNid, EventStateKeyNid, MembershipState, RoomNid};
use sqlx::{PgConnection, Postgres, Transaction};

use super::events::select_event_nid;
use super::nids::{assign_event_state_key_nid, assign_room_nid, select_event_state_key_nid};
use super::PostgresStorage;
use crate::{MembershipLookup, MembershipStorage, StorageError};

/// A transactional view of one user's membership in one room.
///
/// Transitions are written through the tracker's transaction and become
/// visible only after [`MembershipTracker::commit`]. Dropping the tracker
/// without committing rolls everything back. A tracker opened from a
/// [`super::FrontierUpdater`] runs in a savepoint of the frontier's
/// transaction, so its changes are published by the frontier commit.
pub struct MembershipTracker<'t> {
    tx: Transaction<'t, Postgres>,
    room_nid: RoomNid,
    target_user_nid: EventStateKeyNid,
    membership: MembershipState,
}

impl<'t> MembershipTracker<'t> {
    /// Creates the membership row if needed and locks it for this session.
    pub(crate) async fn open(
        mut tx: Transaction<'t, Postgres>,
        room_nid: RoomNid,
        target_user_nid: EventStateKeyNid,
    ) -> Result<Self, StorageError> {
        sqlx::query(
            r#"
            INSERT INTO membership (room_nid, target_nid)
            VALUES ($1, $2)
            ON CONFLICT (room_nid, target_nid) DO NOTHING
            "#,
        )
        .bind(room_nid.get())
        .bind(target_user_nid.get())
        .execute(tx.as_mut())
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;

        let code: i16 = sqlx::query_scalar(
            r#"
            SELECT membership_nid FROM membership
            WHERE room_nid = $1 AND target_nid = $2
            FOR UPDATE
            "#,
        )
        .bind(room_nid.get())
        .bind(target_user_nid.get())
        .fetch_one(tx.as_mut())
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
        let membership =
            MembershipState::from_code(code).ok_or(StorageError::InvalidMembershipState(code))?;

        tracing::debug!(
            room_nid = room_nid.get(),
            target_user_nid = target_user_nid.get(),
            %membership,
            "opened membership tracker"
        );
        Ok(Self {
            tx,
            room_nid,
            target_user_nid,
            membership,
        })
    }

    #[must_use]
    pub fn room_nid(&self) -> RoomNid {
        self.room_nid
    }

    #[must_use]
    pub fn target_user_nid(&self) -> EventStateKeyNid {
        self.target_user_nid
    }

    /// Membership as of the last transition applied through this tracker.
    #[must_use]
    pub fn membership(&self) -> MembershipState {
        self.membership
    }

    #[must_use]
    pub fn is_invite(&self) -> bool {
        self.membership == MembershipState::Invite
    }

    #[must_use]
    pub fn is_join(&self) -> bool {
        self.membership == MembershipState::Join
    }

    #[must_use]
    pub fn is_leave(&self) -> bool {
        self.membership == MembershipState::LeaveOrBan
    }

    /// Records an invite. Returns `false` when the invite event was already
    /// recorded, which is not an error.
    pub async fn set_to_invite(&mut self, event: &Event) -> Result<bool, StorageError> {
        let sender_user_nid = assign_event_state_key_nid(self.conn(), event.sender()).await?;

        let result = sqlx::query(
            r#"
            INSERT INTO invites (invite_event_id, room_nid, target_nid, sender_nid, invite_event_json)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (invite_event_id) DO NOTHING
            "#,
        )
        .bind(event.event_id())
        .bind(self.room_nid.get())
        .bind(self.target_user_nid.get())
        .bind(sender_user_nid.get())
        .bind(event.json())
        .execute(self.conn())
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
        let inserted = result.rows_affected() == 1;

        // Invites are found through the invites table, not the membership event.
        if self.membership != MembershipState::Invite {
            self.update_membership(sender_user_nid, MembershipState::Invite, EventNid(0))
                .await?;
        }
        Ok(inserted)
    }

    /// Moves the user to joined. Unless `is_update` is set, outstanding
    /// invites are retired and their event ids returned.
    pub async fn set_to_join(
        &mut self,
        sender_user_id: &str,
        event_id: &str,
        is_update: bool,
    ) -> Result<Vec<String>, StorageError> {
        let event_nid = select_event_nid(self.conn(), event_id).await?;
        let sender_user_nid = assign_event_state_key_nid(self.conn(), sender_user_id).await?;

        // A join replacing a join has no invite to retire.
        let retired = if is_update {
            Vec::new()
        } else {
            self.retire_invites().await?
        };

        if self.membership != MembershipState::Join || is_update {
            self.update_membership(sender_user_nid, MembershipState::Join, event_nid)
                .await?;
        }
        Ok(retired)
    }

    /// Moves the user to left or banned, retiring outstanding invites.
    pub async fn set_to_leave(
        &mut self,
        sender_user_id: &str,
        event_id: &str,
    ) -> Result<Vec<String>, StorageError> {
        let event_nid = select_event_nid(self.conn(), event_id).await?;
        let sender_user_nid = assign_event_state_key_nid(self.conn(), sender_user_id).await?;
        let retired = self.retire_invites().await?;

        if self.membership != MembershipState::LeaveOrBan {
            self.update_membership(sender_user_nid, MembershipState::LeaveOrBan, event_nid)
                .await?;
        }
        Ok(retired)
    }

    pub async fn commit(self) -> Result<(), StorageError> {
        self.tx
            .commit()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        tracing::debug!(
            room_nid = self.room_nid.get(),
            target_user_nid = self.target_user_nid.get(),
            membership = %self.membership,
            "committed membership tracker"
        );
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), StorageError> {
        self.tx
            .rollback()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        tracing::debug!(
            room_nid = self.room_nid.get(),
            target_user_nid = self.target_user_nid.get(),
            "rolled back membership tracker"
        );
        Ok(())
    }

    fn conn(&mut self) -> &mut PgConnection {
        self.tx.as_mut()
    }

    async fn retire_invites(&mut self) -> Result<Vec<String>, StorageError> {
        sqlx::query_scalar::<_, String>(
            r#"
            UPDATE invites SET retired = TRUE
            WHERE room_nid = $1 AND target_nid = $2 AND NOT retired
            RETURNING invite_event_id
            "#,
        )
        .bind(self.room_nid.get())
        .bind(self.target_user_nid.get())
        .fetch_all(self.conn())
        .await
        .map_err(|error| StorageError::Database(error.to_string()))
    }

    async fn update_membership(
        &mut self,
        sender_user_nid: EventStateKeyNid,
        membership: MembershipState,
        event_nid: EventNid,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE membership
            SET sender_nid = $3, membership_nid = $4, event_nid = $5
            WHERE room_nid = $1 AND target_nid = $2
            "#,
        )
        .bind(self.room_nid.get())
        .bind(self.target_user_nid.get())
        .bind(sender_user_nid.get())
        .bind(membership.code())
        .bind(event_nid.get())
        .execute(self.conn())
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;
        self.membership = membership;
        Ok(())
    }
}

impl PostgresStorage {
    /// Opens a membership tracker in a new transaction, interning the room
    /// and user ids inside it.
    pub async fn membership_tracker(
        &self,
        room_id: &str,
        target_user_id: &str,
    ) -> Result<MembershipTracker<'static>, StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        let room_nid = assign_room_nid(tx.as_mut(), room_id).await?;
        let target_user_nid = assign_event_state_key_nid(tx.as_mut(), target_user_id).await?;
        MembershipTracker::open(tx, room_nid, target_user_nid).await
    }
}

#[async_trait]
impl MembershipStorage for PostgresStorage {
    async fn get_membership(
        &self,
        room_nid: RoomNid,
        user_id: &str,
    ) -> Result<MembershipLookup, StorageError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|error| StorageError::Database(error.to_string()))?;
        let Some(user_nid) = select_event_state_key_nid(&mut conn, user_id).await? else {
            return Ok(MembershipLookup::default());
        };

        let row = sqlx::query_as::<_, (i64, i16)>(
            r#"
            SELECT event_nid, membership_nid FROM membership
            WHERE room_nid = $1 AND target_nid = $2
            "#,
        )
        .bind(room_nid.get())
        .bind(user_nid.get())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;

        let Some((event_nid, code)) = row else {
            return Ok(MembershipLookup::default());
        };
        let membership =
            MembershipState::from_code(code).ok_or(StorageError::InvalidMembershipState(code))?;
        Ok(MembershipLookup {
            event_nid: EventNid(event_nid),
            still_in_room: membership == MembershipState::Join,
        })
    }

    async fn membership_event_nids_for_room(
        &self,
        room_nid: RoomNid,
        join_only: bool,
    ) -> Result<Vec<EventNid>, StorageError> {
        let rows: Vec<i64> = if join_only {
            sqlx::query_scalar::<_, i64>(
                r#"
                SELECT event_nid FROM membership
                WHERE room_nid = $1 AND membership_nid = $2 AND event_nid <> 0
                ORDER BY event_nid ASC
                "#,
            )
            .bind(room_nid.get())
            .bind(MembershipState::Join.code())
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_scalar::<_, i64>(
                r#"
                SELECT event_nid FROM membership
                WHERE room_nid = $1 AND event_nid <> 0
                ORDER BY event_nid ASC
                "#,
            )
            .bind(room_nid.get())
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|error| StorageError::Database(error.to_string()))?;

        Ok(rows.into_iter().map(EventNid).collect())
    }

    async fn invites_for_user(
        &self,
        room_nid: RoomNid,
        target_user_nid: EventStateKeyNid,
    ) -> Result<Vec<EventStateKeyNid>, StorageError> {
        let rows: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT sender_nid FROM invites
            WHERE target_nid = $1 AND room_nid = $2 AND NOT retired
            ORDER BY invite_event_id ASC
            "#,
        )
        .bind(target_user_nid.get())
        .bind(room_nid.get())
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StorageError::Database(error.to_string()))?;

        Ok(rows.into_iter().map(EventStateKeyNid).collect())
    }
}
