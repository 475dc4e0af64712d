use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use std::time::Duration;
use tellus_core::{TellusConfig, WorldState};

fn bench_world_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("world_step");
    group.sample_size(30);
    group.warm_up_time(Duration::from_secs(2));
    group.measurement_time(Duration::from_secs(10));
    let steps: usize = std::env::var("TELLUS_BENCH_STEPS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(32);
    for &size in &[64_u32, 128, 192] {
        group.bench_function(format!("steps{steps}_grid{size}"), |b| {
            b.iter_batched(
                || {
                    let config = TellusConfig {
                        rng_seed: Some(0xBEEF),
                        summary_interval: 0,
                        history_capacity: 0,
                        ..TellusConfig::default()
                    };
                    WorldState::new(size, size, config).expect("world")
                },
                |mut world| {
                    for _ in 0..steps {
                        world.step();
                    }
                    world
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_world_steps);
criterion_main!(benches);
