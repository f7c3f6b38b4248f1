use std::sync::atomic::AtomicI64;
use std::sync::{Arc, Weak};
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use aggregoor::clock::ElapsedClock;
use aggregoor::condition::{ConditionKey, ConditionState, ConditionWizard};
use aggregoor::config::{GaugeMetricConfig, GaugeSamplingType};
use aggregoor::event::LogEvent;
use aggregoor::matcher::{filter_values, translate_field_selector, FieldSelector, Position, StaticMatcherWizard};
use aggregoor::metrics::gauge::{GaugeMetricProducer, ProducerContext};
use aggregoor::metrics::MetricProducer;
use aggregoor::puller::{PullDataReceiver, PullerManager};
use aggregoor::report::proto::ProtoWriter;
use aggregoor::stats::EngineStats;

const ATOM_ID: i32 = 42;
const MS: i64 = 1_000_000;

struct BenchClock {
    now_ns: AtomicI64,
}

impl ElapsedClock for BenchClock {
    fn now_ns(&self) -> i64 {
        self.now_ns.load(std::sync::atomic::Ordering::Relaxed)
    }
}

struct NullPuller;

impl PullerManager for NullPuller {
    fn pull(&self, _tag_id: i32, _timestamp_ns: i64) -> Option<Vec<LogEvent>> {
        Some(Vec::new())
    }

    fn register_receiver(
        &self,
        _tag_id: i32,
        _receiver: Weak<dyn PullDataReceiver>,
        _next_pull_ns: i64,
        _interval_ns: i64,
    ) {
    }

    fn unregister_receiver(&self, _tag_id: i32) {}
}

struct TrueConditionWizard;

impl ConditionWizard for TrueConditionWizard {
    fn query(
        &self,
        _condition_index: usize,
        _keys: &ConditionKey,
        _partial_links: bool,
    ) -> ConditionState {
        ConditionState::True
    }
}

fn build_producer() -> Arc<GaugeMetricProducer> {
    let config = GaugeMetricConfig {
        id: 7,
        atom_id: ATOM_ID,
        bucket_duration: Some(Duration::from_millis(100)),
        sampling_type: GaugeSamplingType::FirstNSamples,
        max_gauge_atoms_per_dimension: 10_000,
        trusted_source: true,
        dimensions_in_what: Some(FieldSelector::simple(ATOM_ID, 1)),
        ..Default::default()
    };
    let ctx = ProducerContext {
        matcher_wizard: Arc::new(StaticMatcherWizard::new(vec![vec![ATOM_ID]])),
        condition_wizard: Arc::new(TrueConditionWizard),
        puller: Arc::new(NullPuller),
        stats: Arc::new(EngineStats::new().expect("build stats")),
        clock: Arc::new(BenchClock {
            now_ns: AtomicI64::new(0),
        }),
    };
    GaugeMetricProducer::new(&config, ctx, 0, None, ConditionState::True, 0, 0)
        .expect("valid config")
}

fn sample_event(dim: i32, ts_ms: i64) -> LogEvent {
    let mut e = LogEvent::new(ATOM_ID, 1000, 1, ts_ms * MS);
    e.write_int32(dim);
    e.write_int64(ts_ms * 37);
    e.write_string("block/sda");
    e
}

fn bench_filter_values(c: &mut Criterion) {
    let selector = FieldSelector {
        field: ATOM_ID,
        position: None,
        children: vec![FieldSelector {
            field: 1,
            position: Some(Position::All),
            children: vec![FieldSelector {
                field: 1,
                position: None,
                children: Vec::new(),
            }],
        }],
    };
    let matchers = translate_field_selector(&selector);

    let mut event = LogEvent::new(ATOM_ID, 1000, 1, 0);
    event.write_attribution_chain(&[(1111, "net"), (2222, "disk"), (3333, "cpu")]);
    event.write_string("payload");

    c.bench_function("matcher/filter_values_attribution_all", |b| {
        b.iter(|| filter_values(black_box(&matchers), black_box(event.values())))
    });
}

fn bench_append_path(c: &mut Criterion) {
    c.bench_function("gauge/append_64_dims", |b| {
        let events: Vec<LogEvent> = (0..64).map(|i| sample_event(i, 1)).collect();
        b.iter_with_setup(build_producer, |producer| {
            for event in &events {
                producer.on_matched_log_event(0, black_box(event));
            }
            black_box(producer.current_dimension_count())
        })
    });
}

fn bench_flush_and_dump(c: &mut Criterion) {
    c.bench_function("gauge/flush_and_dump_report", |b| {
        b.iter_with_setup(
            || {
                let producer = build_producer();
                for ts in 0..50 {
                    producer.on_matched_log_event(0, &sample_event(ts % 8, ts));
                }
                producer
            },
            |producer| {
                let mut out = ProtoWriter::new();
                producer.on_dump_report(500 * MS, true, true, &mut out);
                black_box(out.into_bytes().len())
            },
        )
    });
}

criterion_group!(
    benches,
    bench_filter_values,
    bench_append_path,
    bench_flush_and_dump
);
criterion_main!(benches);
