//! # Capability Bus Benchmarks
//!
//! Hot paths on every inbound message:
//!
//! | Path | Work per call |
//! |------|---------------|
//! | validate_message | decode + Ed25519 verify |
//! | MessageCache::ready | scan one key's senders |
//! | aggregate_mode_raw | count identical payloads |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

use capability_bus::test_utils::{keypair, peer_of, signed_message};
use capability_bus::{aggregate_mode_raw, validate_message, MessageCache, PROTOCOL_VERSION};
use shared_types::{MessageBody, Method, PeerId};

fn bench_validate_message(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatcher");
    group.measurement_time(Duration::from_secs(5));

    let local = peer_of(&keypair(1));
    for size in [64usize, 4096] {
        let body = MessageBody::new("cap_id@1", 1, "", 2, Method::TriggerEvent, vec![0xAB; size]);
        let msg = signed_message(&keypair(2), local, body);
        group.bench_with_input(BenchmarkId::new("validate_message", size), &msg, |b, msg| {
            b.iter(|| validate_message(black_box(msg), &local, PROTOCOL_VERSION))
        });
    }
    group.finish();
}

fn bench_message_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_cache");

    for senders in [4u8, 31] {
        let mut cache: MessageCache<&str, PeerId> = MessageCache::new();
        for i in 0..senders {
            cache.insert("event-1", PeerId::new([i; 32]), 1_000 + i64::from(i), vec![i; 32]);
        }
        let min_count = usize::from(senders) * 2 / 3 + 1;
        group.bench_function(BenchmarkId::new("ready", senders), |b| {
            b.iter(|| cache.ready(black_box(&"event-1"), min_count, 1_000, false))
        });
    }
    group.finish();
}

fn bench_mode_aggregation(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregation");

    for n in [4usize, 31] {
        let payloads: Vec<Vec<u8>> = (0..n).map(|i| vec![(i % 3) as u8; 256]).collect();
        group.bench_with_input(BenchmarkId::new("mode", n), &payloads, |b, payloads| {
            b.iter(|| aggregate_mode_raw(black_box(payloads), 1))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_validate_message,
    bench_message_cache,
    bench_mode_aggregation
);
criterion_main!(benches);
