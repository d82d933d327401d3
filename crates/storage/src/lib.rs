#![forbid(unsafe_code)]

//! Persistent storage for a room server's view of the room graph.
//!
//! Strings that recur across events (room ids, event types, state keys) are
//! interned into numeric ids, events are stored once per event id, room state
//! is kept as immutable blocks grouped into snapshots, and each room's frontier
//! of latest events and per-user membership are advanced through explicit
//! transactional sessions on [`PostgresStorage`].

use std::collections::HashMap;

use async_trait::async_trait;
use roomstore_core::{
    Event, EventNid, EventReference, EventStateKeyNid, EventTypeNid, RoomNid, StateAtEvent,
    StateBlockNid, StateBlockNidList, StateEntry, StateEntryList, StateKeyTuple, StateSnapshotNid,
    StoredEvent, TransactionId,
};

pub mod config;
pub mod postgres;

pub use config::StorageConfig;
pub use postgres::{FrontierUpdater, MembershipTracker, PostgresStorage};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("lost the insert race for {table} key {key:?} twice")]
    DuplicateKey { table: &'static str, key: String },
    #[error("stored event {event_nid} is corrupt: {reason}")]
    CorruptEvent { event_nid: EventNid, reason: String },
    #[error("event not found: {0}")]
    MissingEvent(String),
    #[error("event {0} has no recorded state")]
    MissingState(String),
    #[error("event NID {0} not found")]
    EventNidNotFound(EventNid),
    #[error("room NID {0} not found")]
    RoomNotFound(RoomNid),
    #[error("state snapshot {0} not found")]
    StateSnapshotNotFound(StateSnapshotNid),
    #[error("state block {0} not found")]
    StateBlockNotFound(StateBlockNid),
    #[error("state block has more than one entry for {0:?}")]
    DuplicateStateEntry(StateKeyTuple),
    #[error("unknown membership code {0}")]
    InvalidMembershipState(i16),
    #[error("invalid frontier: {0}")]
    InvalidFrontier(String),
    #[error("room alias already exists: {0}")]
    AliasExists(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("DATABASE_URL is not set")]
    MissingDatabaseUrl,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// The frontier of a room as seen by read-only queries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LatestEventIds {
    pub references: Vec<EventReference>,
    pub state_snapshot_nid: StateSnapshotNid,
    /// Largest depth among the latest events, zero for an empty frontier.
    pub max_depth: i64,
}

/// The membership event a user last had in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MembershipLookup {
    /// Zero when the user has never had a membership event in the room.
    pub event_nid: EventNid,
    pub still_in_room: bool,
}

// ---------------------------------------------------------------------------
// Domain-specific storage traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait IdentifierStorage: Send + Sync {
    async fn assign_room_nid(&self, room_id: &str) -> Result<RoomNid, StorageError>;
    async fn assign_event_type_nid(&self, event_type: &str) -> Result<EventTypeNid, StorageError>;
    async fn assign_event_state_key_nid(
        &self,
        event_state_key: &str,
    ) -> Result<EventStateKeyNid, StorageError>;
    /// `None` when the room has never been referenced.
    async fn room_nid(&self, room_id: &str) -> Result<Option<RoomNid>, StorageError>;
    async fn event_type_nids(
        &self,
        event_types: &[String],
    ) -> Result<HashMap<String, EventTypeNid>, StorageError>;
    async fn event_state_key_nids(
        &self,
        event_state_keys: &[String],
    ) -> Result<HashMap<String, EventStateKeyNid>, StorageError>;
    async fn event_state_keys(
        &self,
        event_state_key_nids: &[EventStateKeyNid],
    ) -> Result<HashMap<EventStateKeyNid, String>, StorageError>;
}

#[async_trait]
pub trait EventStorage: Send + Sync {
    /// Stores an event, returning the existing ids when the event id is
    /// already known.
    async fn store_event(
        &self,
        event: &Event,
        transaction: Option<&TransactionId>,
        auth_event_nids: &[EventNid],
    ) -> Result<(RoomNid, StateAtEvent), StorageError>;
    async fn events(&self, event_nids: &[EventNid]) -> Result<Vec<StoredEvent>, StorageError>;
    async fn events_from_ids(&self, event_ids: &[String]) -> Result<Vec<StoredEvent>, StorageError>;
    async fn event_nids(&self, event_ids: &[String])
        -> Result<HashMap<String, EventNid>, StorageError>;
    async fn event_ids(
        &self,
        event_nids: &[EventNid],
    ) -> Result<HashMap<EventNid, String>, StorageError>;
    async fn state_entries_for_event_ids(
        &self,
        event_ids: &[String],
    ) -> Result<Vec<StateEntry>, StorageError>;
    async fn state_at_event_ids(
        &self,
        event_ids: &[String],
    ) -> Result<Vec<StateAtEvent>, StorageError>;
    /// Records the snapshot of room state before `event_nid`.
    async fn set_state(
        &self,
        event_nid: EventNid,
        state_snapshot_nid: StateSnapshotNid,
    ) -> Result<(), StorageError>;
    async fn snapshot_nid_from_event_id(
        &self,
        event_id: &str,
    ) -> Result<StateSnapshotNid, StorageError>;
    async fn latest_event_ids(&self, room_nid: RoomNid) -> Result<LatestEventIds, StorageError>;
}

#[async_trait]
pub trait StateStorage: Send + Sync {
    /// Creates a snapshot from `state_block_nids`, first appending a new block
    /// holding `state` when it is non-empty. Existing blocks are never touched.
    async fn add_state(
        &self,
        room_nid: RoomNid,
        state_block_nids: &[StateBlockNid],
        state: &[StateEntry],
    ) -> Result<StateSnapshotNid, StorageError>;
    async fn state_block_nids(
        &self,
        state_snapshot_nids: &[StateSnapshotNid],
    ) -> Result<Vec<StateBlockNidList>, StorageError>;
    /// One list per requested block, in request order.
    async fn state_entries(
        &self,
        state_block_nids: &[StateBlockNid],
    ) -> Result<Vec<StateEntryList>, StorageError>;
    /// Like [`StateStorage::state_entries`] but keeping only the given slots.
    async fn state_entries_for_tuples(
        &self,
        state_block_nids: &[StateBlockNid],
        state_key_tuples: &[StateKeyTuple],
    ) -> Result<Vec<StateEntryList>, StorageError>;
}

#[async_trait]
pub trait MembershipStorage: Send + Sync {
    async fn get_membership(
        &self,
        room_nid: RoomNid,
        user_id: &str,
    ) -> Result<MembershipLookup, StorageError>;
    async fn membership_event_nids_for_room(
        &self,
        room_nid: RoomNid,
        join_only: bool,
    ) -> Result<Vec<EventNid>, StorageError>;
    /// Senders of the outstanding invites for a user in a room.
    async fn invites_for_user(
        &self,
        room_nid: RoomNid,
        target_user_nid: EventStateKeyNid,
    ) -> Result<Vec<EventStateKeyNid>, StorageError>;
}

#[async_trait]
pub trait TransactionStorage: Send + Sync {
    /// `None` when no event was recorded for this transaction.
    async fn transaction_event_id(
        &self,
        transaction: &TransactionId,
        user_id: &str,
    ) -> Result<Option<String>, StorageError>;
}

#[async_trait]
pub trait AliasStorage: Send + Sync {
    async fn set_room_alias(
        &self,
        alias: &str,
        room_id: &str,
        creator_user_id: &str,
    ) -> Result<(), StorageError>;
    async fn room_id_for_alias(&self, alias: &str) -> Result<Option<String>, StorageError>;
    async fn aliases_for_room_id(&self, room_id: &str) -> Result<Vec<String>, StorageError>;
    async fn creator_id_for_alias(&self, alias: &str) -> Result<Option<String>, StorageError>;
    /// Removing an unknown alias is a no-op.
    async fn remove_room_alias(&self, alias: &str) -> Result<(), StorageError>;
}

/// Unified supertrait for code that needs access to all storage domains.
pub trait Storage:
    IdentifierStorage
    + EventStorage
    + StateStorage
    + MembershipStorage
    + TransactionStorage
    + AliasStorage
{
}

impl<T> Storage for T where
    T: IdentifierStorage
        + EventStorage
        + StateStorage
        + MembershipStorage
        + TransactionStorage
        + AliasStorage
{
}

// ---------------------------------------------------------------------------
// Migration helpers
// ---------------------------------------------------------------------------

pub async fn migrate() -> Result<(), StorageError> {
    let config = StorageConfig::from_env()?;
    let storage = PostgresStorage::connect_with(&config).await?;
    migrate_with_pool(storage.pool()).await?;
    storage.close().await;
    Ok(())
}

pub async fn migrate_with_pool(pool: &sqlx::PgPool) -> Result<(), StorageError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|error| StorageError::Migration(error.to_string()))?;
    tracing::info!("room storage migrations applied");
    Ok(())
}
