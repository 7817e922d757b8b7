//! # Event Bus Benchmarks
//!
//! Hot paths on every delivery: envelope codec, aggregate routing and the
//! keyed worker pool.
//!
//! ## Usage
//!
//! ```bash
//! cargo bench --package bus-tests --bench bus_benchmarks
//! cargo bench --package bus-tests --bench bus_benchmarks -- pool
//! ```

use std::collections::HashMap;
use std::time::Duration;

use bus_types::Envelope;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use event_bus::{
    extract_aggregate_id, fnv1a_32, worker_index, KeyedWorkerPool, KeyedWorkerPoolConfig,
    SubjectPattern,
};
use futures::FutureExt;
use rand::Rng;

fn sample_envelope(payload_len: usize) -> Envelope {
    let body = serde_json::json!({
        "order_id": "order-42",
        "note": "x".repeat(payload_len),
    });
    Envelope::new(
        "order-42",
        "OrderUpdated",
        7,
        serde_json::to_vec(&body).unwrap_or_default(),
    )
    .with_trace_id("trace-1")
}

fn bench_envelope_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope");
    for payload_len in [64usize, 1024, 16 * 1024] {
        let envelope = sample_envelope(payload_len);
        let bytes = envelope.to_bytes().unwrap_or_default();
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", payload_len), &envelope, |b, e| {
            b.iter(|| black_box(e.to_bytes()))
        });
        group.bench_with_input(BenchmarkId::new("decode", payload_len), &bytes, |b, raw| {
            b.iter(|| black_box(Envelope::from_bytes(raw)))
        });
    }
    group.finish();
}

fn bench_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing");
    let ids: Vec<String> = (0..1024).map(|i| format!("order-{i}")).collect();

    group.bench_function("fnv1a_32", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 1) % ids.len();
            black_box(fnv1a_32(ids[i].as_bytes()))
        })
    });
    group.bench_function("worker_index_256", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 1) % ids.len();
            black_box(worker_index(&ids[i], 256))
        })
    });

    let bytes = sample_envelope(256).to_bytes().unwrap_or_default();
    let mut headers = HashMap::new();
    headers.insert("X-Aggregate-ID".to_string(), "order-42".to_string());
    group.bench_function("extract_from_envelope", |b| {
        b.iter(|| {
            black_box(extract_aggregate_id(
                &bytes,
                &HashMap::new(),
                None,
                None,
                SubjectPattern::default(),
            ))
        })
    });
    group.bench_function("extract_from_header", |b| {
        b.iter(|| {
            black_box(extract_aggregate_id(
                b"not json",
                &headers,
                None,
                None,
                SubjectPattern::default(),
            ))
        })
    });
    group.finish();
}

fn bench_pool(c: &mut Criterion) {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => panic!("failed to build runtime: {e}"),
    };

    let mut group = c.benchmark_group("pool");
    const BATCH: u64 = 1_000;
    group.throughput(Throughput::Elements(BATCH));

    for aggregates in [1usize, 16, 1024] {
        group.bench_with_input(
            BenchmarkId::new("submit_and_wait", aggregates),
            &aggregates,
            |b, &aggregates| {
                b.iter(|| {
                    runtime.block_on(async {
                        let pool = KeyedWorkerPool::new(KeyedWorkerPoolConfig {
                            worker_count: 64,
                            queue_size: 256,
                            ..KeyedWorkerPoolConfig::default()
                        });
                        let mut rng = rand::thread_rng();
                        let mut completions = Vec::with_capacity(BATCH as usize);
                        for _ in 0..BATCH {
                            let id = format!("order-{}", rng.gen_range(0..aggregates));
                            let job = async { Ok(()) }.boxed();
                            if let Ok(completion) = pool.submit(&id, job).await {
                                completions.push(completion);
                            }
                        }
                        for completion in completions {
                            let _ = black_box(completion.await);
                        }
                        pool.close().await;
                    });
                })
            },
        );
    }
    group.finish();
}

criterion_group!(
    name = bus_benches;
    config = Criterion::default()
        .sample_size(50)
        .measurement_time(Duration::from_secs(5));
    targets = bench_envelope_codec, bench_routing, bench_pool,
);

criterion_main!(bus_benches);
