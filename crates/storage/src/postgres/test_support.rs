use roomstore_core::{encode_reference_hash, Event};
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;

use super::PostgresStorage;

// Re-export all domain traits so test modules can `use super::super::test_support::*`
// and have every trait method available on PostgresStorage.
#[allow(unused_imports)]
pub(super) use crate::{
    AliasStorage, EventStorage, IdentifierStorage, MembershipStorage, StateStorage, Storage,
    StorageError, TransactionStorage,
};

pub(super) async fn test_storage() -> Option<PostgresStorage> {
    let database_url = match std::env::var("DATABASE_URL") {
        Ok(value) => value,
        Err(_) => return None,
    };

    // Each test gets its own schema for full isolation when running in parallel.
    let schema = format!("test_{}", uuid::Uuid::new_v4().simple());
    let mut opts: sqlx::postgres::PgConnectOptions =
        database_url.parse().expect("parse DATABASE_URL");
    opts = opts.options([("search_path", schema.as_str())]);
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect_with(opts)
        .await
        .expect("connect test database");
    sqlx::query(&format!("CREATE SCHEMA \"{schema}\""))
        .execute(&pool)
        .await
        .expect("create test schema");

    crate::migrate_with_pool(&pool)
        .await
        .expect("apply migrations");
    Some(PostgresStorage::from_pool(pool))
}

fn prev_events(prevs: &[&Event]) -> Value {
    prevs
        .iter()
        .map(|prev| {
            json!([
                prev.event_id(),
                {"sha256": encode_reference_hash(prev.reference_sha256())}
            ])
        })
        .collect()
}

pub(super) fn message_event(
    event_id: &str,
    room_id: &str,
    sender: &str,
    depth: i64,
    prevs: &[&Event],
) -> Event {
    Event::from_value(json!({
        "event_id": event_id,
        "room_id": room_id,
        "sender": sender,
        "type": "m.room.message",
        "depth": depth,
        "prev_events": prev_events(prevs),
        "content": {"body": format!("message {event_id}")},
    }))
    .expect("message event")
}

pub(super) fn state_event(
    event_id: &str,
    room_id: &str,
    event_type: &str,
    state_key: &str,
    depth: i64,
    prevs: &[&Event],
) -> Event {
    Event::from_value(json!({
        "event_id": event_id,
        "room_id": room_id,
        "sender": "@creator:example.org",
        "type": event_type,
        "state_key": state_key,
        "depth": depth,
        "prev_events": prev_events(prevs),
        "content": {},
    }))
    .expect("state event")
}

pub(super) fn member_event(
    event_id: &str,
    room_id: &str,
    sender: &str,
    target: &str,
    membership: &str,
    depth: i64,
    prevs: &[&Event],
) -> Event {
    Event::from_value(json!({
        "event_id": event_id,
        "room_id": room_id,
        "sender": sender,
        "type": "m.room.member",
        "state_key": target,
        "depth": depth,
        "prev_events": prev_events(prevs),
        "content": {"membership": membership},
    }))
    .expect("member event")
}
