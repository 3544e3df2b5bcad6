//! Performance benchmarks for audit-stream
//!
//! Run with: cargo bench

use audit_stream::anomaly::AnomalyDetector;
use audit_stream::clock::ManualClock;
use audit_stream::config::{DetectorConfig, PipelineConfig};
use audit_stream::enrich::Enricher;
use audit_stream::pipeline::Pipeline;
use audit_stream::provider::memory::MemoryProvider;
use audit_stream::provider::EventProvider;
use audit_stream::window::{TimeDomain, TumblingWindows, WindowAggregator};
use audit_stream::RawEvent;
use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

fn sample_event(i: u64) -> RawEvent {
    RawEvent::new("USER_AUTHENTICATION", format!("u{}", i % 100), "login", 1_000 + i)
        .with_metadata("ip", if i % 2 == 0 { "10.0.0.7" } else { "203.0.113.9" })
}

fn bench_decode(c: &mut Criterion) {
    let payload = serde_json::to_vec(&serde_json::json!({
        "id": "4b8f0e0e",
        "event_type": "PAYMENT_TRANSACTION",
        "user_id": "u42",
        "action": "transfer",
        "timestamp": "2024-03-01T12:00:00.123456",
        "ipfs_hash": "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG",
        "metadata": {"ip": "203.0.113.9", "amount": 125.5}
    }))
    .unwrap();

    c.bench_function("RawEvent::from_slice", |b| {
        b.iter(|| RawEvent::from_slice(&payload).unwrap());
    });
}

fn bench_enrich_and_detect(c: &mut Criterion) {
    let clock = ManualClock::new(0);
    let enricher = Enricher::new(
        Arc::new(audit_stream::enrich::PrivateRangeLocator),
        Arc::new(clock.clone()),
    );

    c.bench_function("Enricher::enrich", |b| {
        let raw = sample_event(1);
        b.iter(|| enricher.enrich(raw.clone()));
    });

    c.bench_function("AnomalyDetector::detect (100 keys)", |b| {
        let mut detector =
            AnomalyDetector::with_clock(0, DetectorConfig::default(), Arc::new(clock.clone()));
        let events: Vec<_> = (0..100)
            .map(|i| enricher.enrich(sample_event(i)).into_event())
            .collect();
        let mut i = 0usize;
        b.iter(|| {
            clock.advance(7);
            i = (i + 1) % events.len();
            detector.detect(&events[i])
        });
    });
}

fn bench_window_aggregation(c: &mut Criterion) {
    let clock = ManualClock::new(0);
    let enricher = Enricher::new(
        Arc::new(audit_stream::enrich::PrivateRangeLocator),
        Arc::new(clock.clone()),
    );
    let events: Vec<_> = (0..1_000)
        .map(|i| enricher.enrich(sample_event(i)).into_event())
        .collect();

    c.bench_function("WindowAggregator 1000 events + close", |b| {
        b.iter(|| {
            let mut agg = WindowAggregator::with_clock(
                0,
                TumblingWindows::new(60_000),
                TimeDomain::EventTime,
                Arc::new(clock.clone()),
            );
            for e in &events {
                agg.add(e.clone()).unwrap();
            }
            agg.advance_to(u64::MAX).unwrap()
        });
    });
}

fn bench_pipeline_end_to_end(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("pipeline");
    group.sample_size(10);
    for count in [100u64, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.to_async(&rt).iter(|| async move {
                let provider = MemoryProvider::new();
                for i in 0..count {
                    let payload = serde_json::to_vec(&sample_event(i)).unwrap();
                    provider
                        .publish("audit-events", Bytes::from(payload))
                        .await
                        .unwrap();
                }
                provider.close_topic("audit-events").await;

                Pipeline::new(PipelineConfig::default(), Arc::new(provider))
                    .with_clock(Arc::new(ManualClock::new(1_000)))
                    .run(std::future::pending::<()>())
                    .await
                    .unwrap()
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_decode,
    bench_enrich_and_detect,
    bench_window_aggregation,
    bench_pipeline_end_to_end,
);
criterion_main!(benches);
