use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use roomstore_core::{Event, EventNid, EventStateKeyNid, EventTypeNid, StateEntry, StateKeyTuple};
use roomstore_storage::{
    migrate_with_pool, EventStorage, IdentifierStorage, PostgresStorage, StateStorage,
};
use serde_json::json;

const ROOM_ID: &str = "!bench:example.org";
const SEED_STATE_ENTRIES: i64 = 500;

fn bench_postgres_assign_hot(c: &mut Criterion) {
    let Some(context) = BenchContext::new() else {
        eprintln!("Skipping postgres_assign_hot benchmark: set DATABASE_URL to run storage benches");
        return;
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("build runtime");

    let storage = context.storage.clone();
    runtime.block_on(async {
        storage
            .assign_event_type_nid("m.room.member")
            .await
            .expect("seed event type");
    });

    c.bench_function("postgres_assign_hot", |b| {
        b.to_async(&runtime).iter(|| {
            let storage = storage.clone();
            async move {
                let nid = storage
                    .assign_event_type_nid("m.room.member")
                    .await
                    .expect("assign should succeed");
                black_box(nid);
            }
        });
    });
}

fn bench_postgres_store_event(c: &mut Criterion) {
    let Some(context) = BenchContext::new() else {
        eprintln!("Skipping postgres_store_event benchmark: set DATABASE_URL to run storage benches");
        return;
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("build runtime");

    let storage = context.storage.clone();
    let next_id = Arc::new(AtomicU64::new(1));
    c.bench_function("postgres_store_event", |b| {
        b.to_async(&runtime).iter(|| {
            let storage = storage.clone();
            let next_id = Arc::clone(&next_id);
            async move {
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let event = benchmark_event(id);
                let (_, state) = storage
                    .store_event(&event, None, &[])
                    .await
                    .expect("store should succeed");
                black_box(state.event_nid());
            }
        });
    });
}

fn bench_postgres_state_entries(c: &mut Criterion) {
    let Some(context) = BenchContext::new() else {
        eprintln!("Skipping postgres_state_entries benchmark: set DATABASE_URL to run storage benches");
        return;
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("build runtime");

    let storage = context.storage.clone();
    let block_nids = runtime.block_on(async {
        let room_nid = storage.assign_room_nid(ROOM_ID).await.expect("seed room");
        let entries: Vec<StateEntry> = (1..=SEED_STATE_ENTRIES)
            .map(|index| {
                StateEntry::new(
                    StateKeyTuple::new(EventTypeNid(1), EventStateKeyNid(index)),
                    EventNid(index),
                )
            })
            .collect();
        let snapshot_nid = storage
            .add_state(room_nid, &[], &entries)
            .await
            .expect("seed state");
        let lists = storage
            .state_block_nids(&[snapshot_nid])
            .await
            .expect("load block list");
        lists
            .into_iter()
            .flat_map(|list| list.state_block_nids)
            .collect::<Vec<_>>()
    });

    c.bench_function("postgres_state_entries", |b| {
        b.to_async(&runtime).iter(|| {
            let storage = storage.clone();
            let block_nids = block_nids.clone();
            async move {
                let lists = storage
                    .state_entries(&block_nids)
                    .await
                    .expect("state entries should succeed");
                black_box(lists.len());
            }
        });
    });
}

struct BenchContext {
    storage: PostgresStorage,
}

impl BenchContext {
    fn new() -> Option<Self> {
        let database_url = std::env::var("DATABASE_URL").ok()?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("build setup runtime");

        let storage = runtime.block_on(async {
            let admin = PostgresStorage::connect(&database_url)
                .await
                .expect("connect admin pool");

            let schema = format!("bench_roomstore_{}", unique_suffix());
            let drop_schema = format!("DROP SCHEMA IF EXISTS \"{schema}\" CASCADE");
            sqlx::query(&drop_schema)
                .execute(admin.pool())
                .await
                .expect("drop old benchmark schema");

            let create_schema = format!("CREATE SCHEMA \"{schema}\"");
            sqlx::query(&create_schema)
                .execute(admin.pool())
                .await
                .expect("create benchmark schema");
            admin.close().await;

            let scoped_url = scoped_database_url(&database_url, &schema);
            let storage = PostgresStorage::connect(&scoped_url)
                .await
                .expect("connect scoped benchmark storage");
            migrate_with_pool(storage.pool())
                .await
                .expect("run benchmark migrations");
            storage
        });

        Some(Self { storage })
    }
}

fn benchmark_event(index: u64) -> Event {
    Event::from_value(json!({
        "event_id": format!("$bench{index}"),
        "room_id": ROOM_ID,
        "sender": "@bench:example.org",
        "type": "m.room.message",
        "depth": index,
        "prev_events": [],
        "content": {"body": "bench"},
    }))
    .expect("benchmark event")
}

fn scoped_database_url(base_database_url: &str, schema: &str) -> String {
    let separator = if base_database_url.contains('?') {
        '&'
    } else {
        '?'
    };
    format!("{base_database_url}{separator}options=-csearch_path%3D{schema}")
}

fn unique_suffix() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time should be after epoch");
    format!("{}{}", now.as_secs(), now.subsec_nanos())
}

criterion_group!(
    benches,
    bench_postgres_assign_hot,
    bench_postgres_store_event,
    bench_postgres_state_entries
);
criterion_main!(benches);
