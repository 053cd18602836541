use backpack_flow::{Backpack, BackpackConfig, PackOptions};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;

fn options() -> PackOptions {
    PackOptions::for_node("bench", "bench", "bench.writer")
}

/// Benchmark: single pack into a warm store
fn bench_pack_single(c: &mut Criterion) {
    let store = Backpack::new();
    c.bench_function("pack_single", |b| {
        b.iter(|| {
            black_box(
                store
                    .pack(
                        "key1",
                        json!({"name": "Alice", "age": 30, "email": "alice@example.com"}),
                        options(),
                    )
                    .unwrap(),
            )
        })
    });
}

/// Benchmark: sequential packs to distinct keys
fn bench_pack_sequential(c: &mut Criterion) {
    let mut group = c.benchmark_group("pack_sequential");
    for size in [10, 100, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let store = Backpack::with_config(BackpackConfig {
                    max_history: size * 2,
                    ..BackpackConfig::default()
                });
                for i in 0..size {
                    store
                        .pack(format!("key{i}"), json!({"id": i}), options())
                        .unwrap();
                }
            });
        });
    }
    group.finish();
}

/// Benchmark: unpack from a populated store
fn bench_unpack(c: &mut Criterion) {
    let store = Backpack::new();
    for i in 0..1000 {
        store
            .pack(format!("key{i}"), json!({"id": i}), options())
            .unwrap();
    }
    c.bench_function("unpack", |b| {
        b.iter(|| black_box(store.unpack("key500", Some("bench")).unwrap()))
    });
}

/// Benchmark: wildcard namespace query over mixed namespaces
fn bench_namespace_query(c: &mut Criterion) {
    let store = Backpack::new();
    for i in 0..500 {
        let ns = if i % 2 == 0 { "sales.chat" } else { "ops.audit" };
        store
            .pack(
                format!("key{i}"),
                json!(i),
                PackOptions::for_node("bench", "bench", ns),
            )
            .unwrap();
    }
    c.bench_function("namespace_query", |b| {
        b.iter(|| black_box(store.unpack_by_namespace("sales.*", None)))
    });
}

/// Benchmark: snapshot reconstruction by history replay
fn bench_snapshot_at_commit(c: &mut Criterion) {
    let store = Backpack::new();
    for i in 0..500 {
        store.pack("key", json!(i), options()).unwrap();
    }
    let mid = store.get_history()[250].commit_id.clone();
    c.bench_function("snapshot_at_commit", |b| {
        b.iter(|| black_box(store.get_snapshot_at_commit(&mid).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_pack_single,
    bench_pack_sequential,
    bench_unpack,
    bench_namespace_query,
    bench_snapshot_at_commit
);
criterion_main!(benches);
