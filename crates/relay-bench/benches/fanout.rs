//! Fan-out benchmarks for the hub registry.
//!
//! Measures one routed envelope against registries of increasing size, with
//! every outbound queue drained between iterations so nobody is evicted.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use relay_core::{ClientKey, Identity, Registration, Registry};
use relay_protocol::{codec, Envelope};
use tokio::sync::mpsc;

fn populate(size: usize) -> (Registry, Vec<mpsc::Receiver<Bytes>>) {
    let mut registry = Registry::new();
    let mut queues = Vec::with_capacity(size);

    for i in 0..size {
        let (tx, rx) = mpsc::channel(16);
        registry.register(Registration {
            key: ClientKey::next(),
            identity: Identity::new(format!("u{i}"), format!("user {i}")),
            outbound: tx,
        });
        queues.push(rx);
    }

    (registry, queues)
}

fn envelope(to: Option<&str>) -> Envelope {
    let payload = codec::decode_inbound(br#"{"msg": "hello there", "n": 42}"#)
        .unwrap_or_default();
    let envelope = Envelope::from_client("u0", "user 0", payload);
    match to {
        Some(to) => envelope.with_to(to),
        None => envelope,
    }
}

fn drain(queues: &mut [mpsc::Receiver<Bytes>]) {
    for rx in queues {
        while rx.try_recv().is_ok() {}
    }
}

fn bench_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast");
    let envelope = envelope(None);

    for size in [10usize, 100, 1_000, 10_000] {
        let (mut registry, mut queues) = populate(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let outcome = registry.route(black_box(&envelope));
                drain(&mut queues);
                outcome
            })
        });
    }

    group.finish();
}

fn bench_directed(c: &mut Criterion) {
    let mut group = c.benchmark_group("directed");
    let envelope = envelope(Some("u1"));

    for size in [10usize, 1_000, 10_000] {
        let (mut registry, mut queues) = populate(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let outcome = registry.route(black_box(&envelope));
                while queues[1].try_recv().is_ok() {}
                outcome
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_broadcast, bench_directed);
criterion_main!(benches);
