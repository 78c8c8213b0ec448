//! Benchmarks for loop dispatch and message cloning

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use hostrt::runtime::TimerQueue;
use hostrt::worker::{deserialize, serialize};
use hostrt::{Runtime, Value};

/// Benchmark timer insertion and expiry ordering
fn bench_timer_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("timer_queue");

    for &count in &[16usize, 256, 4096] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_function(format!("{}_timers", count), |b| {
            b.iter(|| {
                let mut queue = TimerQueue::new();
                let now = std::time::Instant::now();
                for i in 0..count {
                    let deadline = now + Duration::from_micros((i * 7 % 100) as u64);
                    queue.insert(deadline, Box::new(|_rt: &mut Runtime| Ok(())));
                }
                let due = queue.take_expired(now + Duration::from_millis(1));
                black_box(due.len())
            })
        });
    }

    group.finish();
}

/// Benchmark a full loop run over zero-delay timers
fn bench_timer_dispatch(c: &mut Criterion) {
    c.bench_function("run_256_zero_timers", |b| {
        b.iter(|| {
            let mut rt = Runtime::new();
            for _ in 0..256 {
                rt.set_timeout(Duration::ZERO, |_rt| Ok(()));
            }
            rt.run().unwrap();
            black_box(rt.stats().iterations)
        })
    });
}

fn build_graph(width: usize) -> Value {
    let shared = Value::object([("tag", Value::string("shared"))]);
    let items = (0..width)
        .map(|i| {
            Value::object([
                ("index", Value::Int(i as i64)),
                ("name", Value::string(format!("item-{}", i))),
                ("shared", shared.clone()),
                ("payload", Value::bytes(vec![i as u8; 32])),
            ])
        })
        .collect();
    Value::array(items)
}

/// Benchmark structured clone of a graph with shared nodes
fn bench_message_clone(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_clone");

    for &width in &[8usize, 128, 1024] {
        let graph = build_graph(width);
        group.throughput(Throughput::Elements(width as u64));

        group.bench_function(format!("serialize_{}", width), |b| {
            b.iter(|| black_box(serialize(&graph).unwrap()))
        });

        let message = serialize(&graph).unwrap();
        group.bench_function(format!("round_trip_{}", width), |b| {
            b.iter(|| black_box(deserialize(message.clone())))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_timer_queue,
    bench_timer_dispatch,
    bench_message_clone
);
criterion_main!(benches);
