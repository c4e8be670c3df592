use std::sync::Arc;

use common::AggregateId;
use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use event_store::{
    AppendOptions, EventEnvelope, EventSequencer, EventStoreExt, InMemoryEventStore, MirrorMode,
    TieredConfig, TieredEventStore, Version, VersionRange, store::EventStore,
};

fn make_event(aggregate_id: AggregateId, version: i64) -> EventEnvelope {
    EventEnvelope::builder()
        .aggregate_id(aggregate_id)
        .aggregate_type("Account")
        .event_type("FundsDeposited")
        .version(Version::new(version))
        .payload_raw(serde_json::json!({
            "account_id": aggregate_id.to_string(),
            "amount_cents": version * 100
        }))
        .build()
        .unwrap()
}

fn bench_append_single_event(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("event_store/append_single_event", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryEventStore::new();
                let agg_id = AggregateId::new();
                store
                    .append_event(make_event(agg_id, 1), AppendOptions::expect_new())
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_append_batch_10(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("event_store/append_batch_10", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryEventStore::new();
                let agg_id = AggregateId::new();
                let events: Vec<EventEnvelope> = (1..=10).map(|v| make_event(agg_id, v)).collect();
                store.append(agg_id, events, AppendOptions::new()).await.unwrap();
            });
        });
    });
}

fn bench_append_relaxed_shuffled_1000(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("event_store/append_relaxed_shuffled_1000", |b| {
        b.iter_batched(
            || {
                let agg_id = AggregateId::new();
                // swap neighbours so every pair arrives inverted
                let events: Vec<EventEnvelope> = (0..500)
                    .flat_map(|i| [make_event(agg_id, i * 2 + 2), make_event(agg_id, i * 2 + 1)])
                    .collect();
                (agg_id, events)
            },
            |(agg_id, events)| {
                rt.block_on(async {
                    let store = InMemoryEventStore::new().with_sequencer(EventSequencer::relaxed(10));
                    store.append(agg_id, events, AppendOptions::new()).await.unwrap();
                });
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_sequence_10000(c: &mut Criterion) {
    let agg_id = AggregateId::new();
    let events: Vec<EventEnvelope> = (1..=10_000).rev().map(|v| make_event(agg_id, v)).collect();
    let sequencer = EventSequencer::relaxed(10);

    c.bench_function("sequencer/relaxed_reverse_10000", |b| {
        b.iter_batched(
            || events.clone(),
            |batch| {
                sequencer
                    .order_after(agg_id, Version::initial(), batch)
                    .unwrap()
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_load_window(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryEventStore::new();
    let agg_id = AggregateId::new();

    // Pre-populate with 100 events
    rt.block_on(async {
        let events: Vec<EventEnvelope> = (1..=100).map(|v| make_event(agg_id, v)).collect();
        store.append(agg_id, events, AppendOptions::new()).await.unwrap();
    });

    c.bench_function("event_store/load_from_version_50", |b| {
        b.iter(|| {
            rt.block_on(async {
                store
                    .load(agg_id, VersionRange::starting_at(Version::new(50)))
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_tiered_append_async_mirror(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = rt.block_on(async {
        TieredEventStore::new(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryEventStore::new()),
            TieredConfig {
                mirror: MirrorMode::Async,
                ..Default::default()
            },
        )
    });

    c.bench_function("tiered/append_batch_10_async_mirror", |b| {
        b.iter(|| {
            rt.block_on(async {
                let agg_id = AggregateId::new();
                let events: Vec<EventEnvelope> = (1..=10).map(|v| make_event(agg_id, v)).collect();
                store.append(agg_id, events, AppendOptions::expect_new()).await.unwrap();
            });
        });
    });

    rt.block_on(store.flush_mirror());
}

criterion_group!(
    benches,
    bench_append_single_event,
    bench_append_batch_10,
    bench_append_relaxed_shuffled_1000,
    bench_sequence_10000,
    bench_load_window,
    bench_tiered_append_async_mirror,
);
criterion_main!(benches);
