//! Fan-out benchmarks for the notification bus.

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use profile_core::{BusConfig, ChangeEvent, MemoryStore, NotificationBus, SlowPolicy};
use profile_protocol::{ChangeKind, Profile};
use std::sync::Arc;

fn bus(policy: SlowPolicy) -> NotificationBus {
    let config = BusConfig {
        policy,
        ..Default::default()
    };
    NotificationBus::new(Arc::new(MemoryStore::new()), config)
}

fn event(seq: u64) -> ChangeEvent {
    ChangeEvent::new(seq, ChangeKind::Update, Profile::new("bench", "bench@example.com"))
}

fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish");

    for subscribers in [1usize, 10, 100, 1000] {
        let bus = bus(SlowPolicy::DropOldest);
        let subs: Vec<_> = (0..subscribers)
            .map(|_| bus.subscribe(64).unwrap())
            .collect();

        group.throughput(Throughput::Elements(subscribers as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            &subscribers,
            |b, _| {
                let mut seq = 0;
                b.iter(|| {
                    seq += 1;
                    black_box(bus.publish(black_box(event(seq))))
                });
            },
        );
        drop(subs);
    }
    group.finish();
}

/// One publish into 100 subscribers whose queues are already full.
fn bench_publish_full_queues(c: &mut Criterion) {
    const SUBSCRIBERS: usize = 100;
    const CAPACITY: usize = 8;

    let mut group = c.benchmark_group("publish_full");
    group.throughput(Throughput::Elements(SUBSCRIBERS as u64));

    for policy in [SlowPolicy::DropOldest, SlowPolicy::DropNewest, SlowPolicy::Evict] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{policy:?}")),
            &policy,
            |b, &policy| {
                b.iter_batched(
                    || {
                        let bus = bus(policy);
                        let subs: Vec<_> = (0..SUBSCRIBERS)
                            .map(|_| bus.subscribe(CAPACITY).unwrap())
                            .collect();
                        for seq in 1..=CAPACITY as u64 {
                            bus.publish(event(seq));
                        }
                        (bus, subs)
                    },
                    |(bus, subs)| {
                        black_box(bus.publish(event(CAPACITY as u64 + 1)));
                        (bus, subs)
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }
    group.finish();
}

fn bench_publish_and_drain(c: &mut Criterion) {
    let bus = bus(SlowPolicy::DropOldest);
    let subs: Vec<_> = (0..100).map(|_| bus.subscribe(64).unwrap()).collect();

    c.bench_function("publish_drain_100", |b| {
        let mut seq = 0;
        b.iter(|| {
            seq += 1;
            bus.publish(event(seq));
            for sub in &subs {
                black_box(sub.try_recv());
            }
        })
    });
}

fn bench_subscribe_unsubscribe(c: &mut Criterion) {
    let bus = bus(SlowPolicy::DropOldest);

    c.bench_function("subscribe_unsubscribe", |b| {
        b.iter(|| {
            let sub = bus.subscribe(black_box(64)).unwrap();
            bus.unsubscribe(&sub);
        })
    });
}

criterion_group!(
    benches,
    bench_publish,
    bench_publish_full_queues,
    bench_publish_and_drain,
    bench_subscribe_unsubscribe
);
criterion_main!(benches);
