use armada_core::eventbus::{Source, SubscriptionOptions};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::time::{Duration, Instant};

fn bench_source_fanout(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("eventbus/fanout");
    group.measurement_time(Duration::from_secs(5));

    for subscribers in [1usize, 8, 64] {
        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            &subscribers,
            |b, &n| {
                b.iter_custom(|iters| {
                    rt.block_on(async {
                        let source: Source<u64> = Source::new();
                        let subs: Vec<_> = (0..n)
                            .map(|_| source.subscribe(SubscriptionOptions::unbounded()))
                            .collect();

                        let start = Instant::now();
                        for i in 0..iters {
                            source.send(black_box(i)).await;
                        }
                        let elapsed = start.elapsed();
                        drop(subs);
                        elapsed
                    })
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_source_fanout);
criterion_main!(benches);
