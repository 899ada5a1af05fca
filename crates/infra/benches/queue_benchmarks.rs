use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use jobforge_core::WorkerId;
use jobforge_infra::jobs::{ClaimFilter, InMemoryJobStore, JobStore, NewJob, ReportOutcome};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("tokio runtime")
}

fn bench_enqueue(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("enqueue");

    for batch in [100u64, 1_000] {
        group.throughput(Throughput::Elements(batch));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter(|| {
                rt.block_on(async {
                    let store = InMemoryJobStore::new();
                    for i in 0..batch {
                        let job = NewJob::new("bench", serde_json::json!({"i": i}))
                            .with_priority((i % 10) as i32 + 1);
                        black_box(store.insert(job).await.expect("insert"));
                    }
                })
            });
        });
    }
    group.finish();
}

fn bench_claim_complete(c: &mut Criterion) {
    let rt = runtime();
    let worker = WorkerId::from("bench-worker");
    let filter = ClaimFilter::any();
    let mut group = c.benchmark_group("claim_complete");

    for backlog in [100u64, 1_000] {
        group.throughput(Throughput::Elements(backlog));
        group.bench_with_input(BenchmarkId::from_parameter(backlog), &backlog, |b, &backlog| {
            b.iter_batched(
                || {
                    rt.block_on(async {
                        let store = InMemoryJobStore::new();
                        for i in 0..backlog {
                            let job = NewJob::new("bench", serde_json::json!({}))
                                .with_priority((i % 10) as i32 + 1);
                            store.insert(job).await.expect("insert");
                        }
                        store
                    })
                },
                |store| {
                    rt.block_on(async {
                        while let Some(job) = store.claim_next(&filter, &worker).await.expect("claim") {
                            let outcome = store
                                .complete(job.id, &worker, serde_json::json!({}))
                                .await
                                .expect("complete");
                            assert_eq!(black_box(outcome), ReportOutcome::Applied);
                        }
                    })
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_enqueue, bench_claim_complete);
criterion_main!(benches);
