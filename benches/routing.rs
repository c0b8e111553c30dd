use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;

use ruleflow::rule::filters::{OnSubjectPropertyChanged, PayloadMatch, ValueMatcher};
use ruleflow::rule::processing::{SetPayloadProperty, SetSubjectProperty};
use ruleflow::rule::Arg;
use ruleflow::subject::SUBJECT_PROPERTY_CHANGED;
use ruleflow::{DispatchPolicy, EventRouter, MemoryStore, Payload, ProcEventsLevel, RouterConfig, Rule};

fn router_with_rules(rules: usize, level: ProcEventsLevel) -> EventRouter {
    let router = EventRouter::builder()
        .config(RouterConfig {
            proc_events_level: level,
            ..RouterConfig::default()
        })
        .resolver(MemoryStore::new())
        .build();
    for i in 0..rules {
        // Half of the rules pass their filter.
        let wanted = if i % 2 == 0 { "even" } else { "odd" };
        router.register_rule(
            Rule::builder(format!("rule-{i}"))
                .filter(PayloadMatch::new("/kind", wanted))
                .filter(PayloadMatch::new("/seq", ValueMatcher::Any))
                .processing(SetPayloadProperty::new(format!("seen-{i}"), true))
                .build(),
            &["tick"],
        );
    }
    router
}

fn tick(seq: u64) -> Payload {
    let mut payload = Payload::new();
    payload.insert("kind".into(), json!("even"));
    payload.insert("seq".into(), json!(seq));
    payload
}

fn bench_route(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing/route");
    for rules in [1usize, 16, 128] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("rules", rules), &rules, |b, &rules| {
            let router = router_with_rules(rules, ProcEventsLevel::Disabled);
            let mut subject = router.subject("bench|1").unwrap();
            let mut seq = 0u64;
            b.iter(|| {
                seq += 1;
                black_box(
                    router
                        .route("tick", &mut subject, tick(seq), DispatchPolicy::Never)
                        .unwrap(),
                )
            });
        });
    }
    group.finish();
}

fn bench_route_traced(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing/route_traced");
    for level in [ProcEventsLevel::Light, ProcEventsLevel::Full] {
        group.bench_function(level.to_string(), |b| {
            let router = router_with_rules(16, level);
            let stream = router.subscribe_proc_events();
            let mut subject = router.subject("bench|1").unwrap();
            let mut seq = 0u64;
            b.iter(|| {
                seq += 1;
                router
                    .route("tick", &mut subject, tick(seq), DispatchPolicy::Never)
                    .unwrap();
                black_box(stream.try_iter().count())
            });
        });
    }
    group.finish();
}

fn bench_property_change(c: &mut Criterion) {
    c.bench_function("routing/set_with_change_rule", |b| {
        let router = router_with_rules(0, ProcEventsLevel::Disabled);
        router.register_rule(
            Rule::builder("derive-status")
                .filter(OnSubjectPropertyChanged::new("temp"))
                .processing(SetSubjectProperty::new(
                    "status",
                    Arg::with_payload(|p| json!(if p["value"].as_i64() > Some(30) { "hot" } else { "ok" })),
                ))
                .build(),
            &[SUBJECT_PROPERTY_CHANGED],
        );
        let mut subject = router.subject("sensor|1").unwrap();
        let mut temp = 0i64;
        b.iter(|| {
            temp = (temp + 7) % 60;
            black_box(subject.set("temp", temp).unwrap())
        });
    });
}

fn bench_store(c: &mut Criterion) {
    c.bench_function("routing/cached_writes_then_store", |b| {
        let router = router_with_rules(0, ProcEventsLevel::Disabled);
        let mut subject = router.subject("batch|1").unwrap();
        b.iter(|| {
            for i in 0..32i64 {
                subject.set_muted(&format!("p{i}"), i).unwrap();
            }
            subject.store().unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_route,
    bench_route_traced,
    bench_property_change,
    bench_store
);
criterion_main!(benches);
