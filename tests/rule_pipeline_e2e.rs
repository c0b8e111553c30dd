//! Rules reacting to routed events and to each other's property changes.

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use ruleflow::rule::filters::{CheckSubjectProperty, OnSubjectPropertyChanged, PayloadMatch, ValueMatcher};
use ruleflow::rule::processing::{RaiseError, Route, SetPayloadProperty, SetSubjectProperty};
use ruleflow::storage::resource::{MemoryResourceApi, ResourceBackend, ResourceConfig};
use ruleflow::subject::SUBJECT_PROPERTY_CHANGED;
use ruleflow::{
    Arg, Callable, DispatchError, DispatchPolicy, EventRouter, MemoryStore, Payload, PrefixResolver, PropertyKey,
    RouterConfig, Rule, Subject, SubjectStorage,
};

type Log = Arc<Mutex<Vec<String>>>;

fn log_step(log: &Log, entry: &str) -> impl ruleflow::RuleFunction {
    let log = Arc::clone(log);
    let entry = entry.to_string();
    Callable::new(format!("log:{entry}"), move |_ctx| {
        log.lock().unwrap().push(entry.clone());
        Ok(Value::Null)
    })
}

fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

#[test]
fn property_change_is_handled_before_the_write_returns() {
    let router = EventRouter::builder().build();
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    router.register_rule(
        Rule::builder("outer")
            .processing(log_step(&log, "outer-1"))
            .processing(SetSubjectProperty::new("a", 1))
            .processing(log_step(&log, "outer-2"))
            .build(),
        &["go"],
    );
    router.register_rule(
        Rule::builder("inner")
            .filter(OnSubjectPropertyChanged::new("a"))
            .processing(log_step(&log, "inner"))
            .build(),
        &[SUBJECT_PROPERTY_CHANGED],
    );

    let mut subject = router.subject("job|1").unwrap();
    router
        .route("go", &mut subject, Payload::new(), DispatchPolicy::Never)
        .unwrap();
    assert_eq!(*log.lock().unwrap(), ["outer-1", "inner", "outer-2"]);
}

#[test]
fn filters_short_circuit() {
    let router = EventRouter::builder().build();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    router.register_rule(
        Rule::builder("vip-only")
            .filter(PayloadMatch::new("/tier", "vip"))
            .filter(Callable::new("never-reached", |_ctx| panic!("second filter ran")))
            .processing(log_step(&log, "processed"))
            .build(),
        &["order"],
    );

    let mut subject = router.subject("customer|1").unwrap();
    router
        .route("order", &mut subject, payload(json!({"tier": "basic"})), DispatchPolicy::Never)
        .unwrap();
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn failing_rule_does_not_stop_the_next_one() {
    let router = EventRouter::builder().build();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    router.register_rule(
        Rule::builder("broken")
            .processing(RaiseError::new("boom").failure("ValueError"))
            .processing(log_step(&log, "after-boom"))
            .build(),
        &["tick"],
    );
    router.register_rule(
        Rule::builder("aborts")
            .processing(RaiseError::new("not today"))
            .build(),
        &["tick"],
    );
    router.register_rule(
        Rule::builder("healthy").processing(log_step(&log, "healthy")).build(),
        &["tick"],
    );

    let mut subject = router.subject("clock|1").unwrap();
    let result = router.route("tick", &mut subject, Payload::new(), DispatchPolicy::Never);
    assert!(result.is_ok());
    assert_eq!(*log.lock().unwrap(), ["healthy"]);
}

#[test]
fn payload_changes_are_visible_to_later_rules() {
    let router = EventRouter::builder().build();
    router.register_rule(
        Rule::builder("enrich")
            .processing(SetPayloadProperty::new("region", "eu"))
            .build(),
        &["signup"],
    );
    router.register_rule(
        Rule::builder("copy-region")
            .filter(PayloadMatch::new("/region", ValueMatcher::Any))
            .processing(SetSubjectProperty::new("region", Arg::with_payload(|p| p["region"].clone())))
            .build(),
        &["signup"],
    );

    let mut subject = router.subject("user|7").unwrap();
    router
        .route("signup", &mut subject, Payload::new(), DispatchPolicy::Never)
        .unwrap();
    assert_eq!(subject.get("region").unwrap(), json!("eu"));
}

#[test]
fn self_triggering_rule_stops_at_the_depth_limit() {
    let config = RouterConfig {
        max_route_depth: 5,
        use_cache_default: false,
        ..RouterConfig::default()
    };
    let router = EventRouter::builder().config(config).build();
    router.register_rule(
        Rule::builder("bump")
            .filter(OnSubjectPropertyChanged::new("n"))
            .processing(Callable::new("incr", |ctx| {
                let (new, _) = ctx.subject.incr("n", 1)?;
                Ok(new)
            }))
            .build(),
        &[SUBJECT_PROPERTY_CHANGED],
    );

    let mut subject = router.subject("loop|1").unwrap();
    subject.set("n", 0).unwrap();
    assert_eq!(subject.get("n").unwrap(), json!(5));
}

#[test]
fn muted_writes_do_not_trigger_rules() {
    let router = EventRouter::builder().build();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    router.register_rule(
        Rule::builder("watch-secret")
            .filter(OnSubjectPropertyChanged::new("secret"))
            .processing(log_step(&log, "changed"))
            .build(),
        &[SUBJECT_PROPERTY_CHANGED],
    );
    router.register_rule(
        Rule::builder("write-secret")
            .processing(SetSubjectProperty::new("secret", "s3cr3t").muted())
            .build(),
        &["rotate"],
    );

    let mut subject = router.subject("vault|1").unwrap();
    router
        .route("rotate", &mut subject, Payload::new(), DispatchPolicy::Never)
        .unwrap();
    assert_eq!(subject.get("secret").unwrap(), json!("s3cr3t"));
    assert!(log.lock().unwrap().is_empty());

    subject.set("secret", "rotated").unwrap();
    subject.set("secret", "rotated").unwrap();
    assert_eq!(*log.lock().unwrap(), ["changed"]);
}

#[test]
fn property_changes_are_dispatched_with_the_property_name() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let router = EventRouter::builder()
        .dispatcher(move |event_type: &str, _: &Subject, payload: &Payload, extra: &Payload| {
            sink.lock()
                .unwrap()
                .push((event_type.to_string(), payload.clone(), extra.clone()));
            Ok::<_, DispatchError>(Value::Null)
        })
        .build();

    let mut subject = router.subject("sensor|9").unwrap();
    subject.set("temp", 18).unwrap();
    subject.set_ext("unit", "C").unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let (event_type, payload, extra) = &seen[0];
    assert_eq!(event_type, SUBJECT_PROPERTY_CHANGED);
    assert_eq!(payload["property_name"], json!("temp"));
    assert_eq!(payload["value"], json!(18));
    assert_eq!(payload["old_value"], Value::Null);
    assert_eq!(extra["propertyname"], json!("temp"));
}

#[test]
fn route_step_reaches_another_subject_and_stores_it() {
    let store = MemoryStore::new();
    let router = EventRouter::builder().resolver(store.clone()).build();
    router.register_rule(
        Rule::builder("notify-owner")
            .filter(CheckSubjectProperty::new("owner"))
            .processing(
                Route::new()
                    .event_type("device-alarm")
                    .subject(Arg::<String>::with_subject(|s| {
                        Ok(s.get("owner")?.as_str().unwrap_or_default().to_string())
                    }))
                    .payload(json!({"device": "dev|1"}))
                    .policy(DispatchPolicy::Never),
            )
            .build(),
        &["alarm"],
    );
    router.register_rule(
        Rule::builder("count-alarms")
            .processing(SetSubjectProperty::update("alarms", |old| json!(old.as_i64().unwrap_or(0) + 1)))
            .build(),
        &["device-alarm"],
    );

    let mut device = router.subject("dev|1").unwrap();
    device.set_muted("owner", "user|1").unwrap();
    router
        .route("alarm", &mut device, Payload::new(), DispatchPolicy::Never)
        .unwrap();

    let owner = store.storage("user|1");
    assert_eq!(owner.get(&PropertyKey::default_ns("alarms")).unwrap(), json!(1));
}

#[test]
fn prefix_resolver_sends_cluster_subjects_to_the_resource_backend() {
    const NODE: &str = "/api/v1/nodes/worker-1";
    let api = Arc::new(MemoryResourceApi::new());
    api.create(NODE, json!({"kind": "Node", "metadata": {"name": "worker-1"}}));
    let cluster = ResourceBackend::new(api, ResourceConfig::default());
    let local = MemoryStore::new();

    let router = EventRouter::builder()
        .resolver(PrefixResolver::new(local.clone()).route_stripped("k8s:", cluster.clone()))
        .build();
    router.register_rule(
        Rule::builder("mark-ready")
            .processing(SetSubjectProperty::new("status", "ready"))
            .build(),
        &["heartbeat"],
    );

    router
        .route_to("heartbeat", &format!("k8s:{NODE}"), Payload::new(), DispatchPolicy::Never)
        .unwrap();

    let node = cluster.storage(NODE, None).unwrap();
    assert_eq!(node.get(&PropertyKey::default_ns("status")).unwrap(), json!("ready"));
    assert!(local.subjects().unwrap().is_empty());
}
