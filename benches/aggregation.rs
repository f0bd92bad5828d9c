//! Aggregation throughput per strategy and fleet size.
//!
//! Run with: cargo bench --bench aggregation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fedguard::aggregation::{AdaptiveFilterConfig, AggregationStrategy, Aggregator, AggregatorKind};
use fedguard::model::{ParameterSet, ParameterTensor, WorkerUpdate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const PARAMS: usize = 10_000;

fn fleet(workers: usize, byzantine: usize, rng: &mut StdRng) -> Vec<WorkerUpdate> {
    (0..workers)
        .map(|i| {
            let scale = if i < byzantine { 1000.0 } else { 1.0 };
            let weights: Vec<f32> = (0..PARAMS).map(|_| rng.gen_range(-1.0f32..1.0) * scale).collect();
            let bias = ParameterTensor::zeros("bias", vec![10]);
            let params = ParameterSet::new(vec![ParameterTensor::vector("weights", weights), bias]);
            WorkerUpdate::new(&format!("worker-{}", i), 1, params)
        })
        .collect()
}

fn bench_strategies(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(7);
    let mut group = c.benchmark_group("aggregate");

    for workers in [10usize, 50, 100] {
        let updates = fleet(workers, workers * 3 / 10, &mut rng);
        group.throughput(Throughput::Elements((workers * PARAMS) as u64));

        for kind in [
            AggregatorKind::Mean,
            AggregatorKind::CoordinateMedian,
            AggregatorKind::AdaptiveFilter,
        ] {
            group.bench_with_input(BenchmarkId::new(kind.to_string(), workers), &updates, |b, updates| {
                b.iter(|| {
                    // Fresh strategy per iteration so trust state does not accumulate
                    let mut aggregator =
                        Aggregator::from_kind(kind, &AdaptiveFilterConfig::default()).unwrap();
                    black_box(aggregator.aggregate(black_box(updates)).unwrap());
                });
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_strategies);
criterion_main!(benches);
