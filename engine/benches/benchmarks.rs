//! Performance benchmarks for gitray-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use gitray_engine::{
    diff::diff, hash::blob_hash, patch, transform, Action, BaseItem, BookState, Layout,
};
use serde_json::{json, Map, Value};

fn populated_state(count: u64) -> BookState {
    let mut state = BookState::new();
    for i in 0..count {
        let action = Action::add(
            format!("e{}", i),
            "bills",
            "bills",
            BaseItem::new(format!("bill_{}", i), json!({"amount": i, "note": "Test"})),
        );
        state.apply(&action, 1000 + i).unwrap();
    }
    state
}

fn bench_hashing(c: &mut Criterion) {
    let mut group = c.benchmark_group("hashing");

    for size in [1024usize, 64 * 1024, 1024 * 1024] {
        let bytes = vec![7u8; size];
        group.bench_with_input(BenchmarkId::new("blob_hash", size), &bytes, |b, bytes| {
            b.iter(|| blob_hash(black_box(bytes)))
        });
    }

    group.finish();
}

fn bench_transform(c: &mut Criterion) {
    let mut group = c.benchmark_group("transform");
    let layout = Layout::new();

    for count in [100u64, 1000, 10000] {
        let state = populated_state(count);
        group.bench_with_input(BenchmarkId::new("to_detail", count), &state, |b, state| {
            b.iter(|| transform::to_detail(black_box(state), &layout, 1000))
        });
    }

    group.finish();
}

fn bench_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("diff");
    let layout = Layout::new();

    for count in [1000u64, 10000] {
        let a = transform::to_detail(&populated_state(count), &layout, 100)
            .unwrap()
            .structure();
        let mut edited = populated_state(count);
        edited
            .apply(
                &Action::update("u", "bills", "bills", "bill_0", Map::new()),
                1_000_000,
            )
            .unwrap();
        let b = transform::to_detail(&edited, &layout, 100)
            .unwrap()
            .structure();

        group.bench_with_input(
            BenchmarkId::new("one_chunk_changed", count),
            &(a, b),
            |bench, (a, b)| bench.iter(|| diff(black_box(a), black_box(b))),
        );
    }

    group.finish();
}

fn bench_patch(c: &mut Criterion) {
    let mut group = c.benchmark_group("patch");

    let wide = |offset: i64| -> Map<String, Value> {
        (0..500)
            .map(|i| (format!("key{}", i), json!({"value": i + offset, "nested": {"x": i}})))
            .collect()
    };
    let old = wide(0);
    let new = wide(1);

    group.bench_function("diff_500_keys", |b| {
        b.iter(|| patch::diff(black_box(&old), black_box(&new)))
    });

    let p = patch::diff(&old, &new);
    group.bench_function("merge_500_keys", |b| {
        b.iter(|| patch::merge(black_box(&old), black_box(&p)))
    });

    group.finish();
}

criterion_group!(benches, bench_hashing, bench_transform, bench_diff, bench_patch);
criterion_main!(benches);
