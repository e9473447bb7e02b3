use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use cport_module::{EngineBuilder, InlinePort};
use std::time::Duration;

const WAIT: Option<Duration> = Some(Duration::from_secs(1));

fn bench_inject_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("inject_round_trip");

    group.bench_function("inline", |b| {
        let mut engine = EngineBuilder::new()
            .build_with_port(InlinePort::new(256))
            .unwrap();
        b.iter(|| {
            engine.inject_event(|e, n| {
                black_box((e, n));
            }).unwrap();
            black_box(engine.pump(WAIT).unwrap())
        })
    });

    // Skipped silently where io_uring is unavailable.
    if let Ok(mut engine) = EngineBuilder::new().build() {
        group.bench_function("io_uring", |b| {
            b.iter(|| {
                engine.inject_event(|e, n| {
                    black_box((e, n));
                }).unwrap();
                black_box(engine.pump(WAIT).unwrap())
            })
        });
    }

    group.finish();
}

fn bench_batch_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_dispatch");

    for batch in [8usize, 64, 256].iter() {
        group.bench_with_input(BenchmarkId::new("inline", batch), batch, |b, &batch| {
            let mut engine = EngineBuilder::new()
                .build_with_port(InlinePort::new(512))
                .unwrap();
            b.iter(|| {
                for _ in 0..batch {
                    engine.inject_event(|_, _| {}).unwrap();
                }
                for _ in 0..batch {
                    black_box(engine.pump(WAIT).unwrap());
                }
            })
        });
    }

    group.finish();
}

fn bench_injector_post(c: &mut Criterion) {
    let mut engine = EngineBuilder::new()
        .build_with_port(InlinePort::new(64))
        .unwrap();
    let injector = engine.injector();

    c.bench_function("injector_post_and_pump", |b| {
        b.iter(|| {
            injector.post(|_, _| {}).unwrap();
            black_box(engine.pump(WAIT).unwrap())
        })
    });
}

criterion_group!(benches, bench_inject_round_trip, bench_batch_dispatch, bench_injector_post);
criterion_main!(benches);
