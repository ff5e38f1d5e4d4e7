use armada_core::rollout_types::{PhaseAgentCount, Rollout, RolloutOptions, RolloutProgress, RolloutStatus};
use armada_core::selector::{Labels, Selector};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

fn build_labels(n: usize) -> Vec<Labels> {
    (0..n)
        .map(|i| {
            let mut labels = Labels::new();
            labels.insert("env".into(), if i % 3 == 0 { "prod" } else { "dev" }.into());
            labels.insert("region".into(), format!("r{}", i % 5));
            labels
        })
        .collect()
}

fn bench_selector_match(c: &mut Criterion) {
    let mut group = c.benchmark_group("rollout/selector_match");
    let selector = Selector::parse("env=prod,region=r0").unwrap();

    for n in [100usize, 1000, 10000] {
        let fleet = build_labels(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &fleet, |b, fleet| {
            b.iter(|| fleet.iter().filter(|l| selector.matches(black_box(l))).count())
        });
    }

    group.finish();
}

fn bench_full_rollout(c: &mut Criterion) {
    let options = RolloutOptions {
        start_automatically: true,
        rollback_on_failure: false,
        max_errors: 0,
        phase_agent_count: PhaseAgentCount {
            initial: 3,
            multiplier: 2.0,
            maximum: 500,
        },
    };

    c.bench_function("rollout/drive_10000_agents", |b| {
        b.iter(|| {
            let mut rollout = Rollout::new(options);
            let mut progress = RolloutProgress {
                waiting: 10_000,
                ..Default::default()
            };
            while rollout.status != RolloutStatus::Stable {
                rollout.update_status(progress);
                progress = RolloutProgress {
                    completed: rollout.progress.completed + rollout.progress.pending,
                    errors: 0,
                    pending: 0,
                    waiting: rollout.progress.waiting,
                };
            }
            black_box(rollout.phase)
        })
    });
}

criterion_group!(benches, bench_selector_match, bench_full_rollout);
criterion_main!(benches);
