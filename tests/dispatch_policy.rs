//! Dispatch decisions for every policy and handler configuration.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use ruleflow::rule::Callable;
use ruleflow::{DispatchError, DispatchPolicy, EventRouter, Payload, Rule, RouterError, Subject};

#[derive(Clone, Copy, Debug)]
enum Handlers {
    None,
    Exact,
    WildcardOnly,
}

struct Harness {
    router: EventRouter,
    local_runs: Arc<AtomicUsize>,
    dispatched: Arc<Mutex<Vec<String>>>,
}

fn harness(handlers: Handlers) -> Harness {
    let dispatched = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&dispatched);
    let router = EventRouter::builder()
        .dispatcher(move |event_type: &str, subject: &Subject, _: &Payload, _: &Payload| {
            sink.lock().unwrap().push(format!("{event_type}@{}", subject.name()));
            Ok::<_, DispatchError>(json!("dispatched"))
        })
        .build();

    let local_runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&local_runs);
    let rule = Rule::builder("count")
        .processing(Callable::new("count", move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }))
        .build();
    match handlers {
        Handlers::None => {}
        Handlers::Exact => {
            router.register_rule(rule, &["order-placed"]);
        }
        Handlers::WildcardOnly => {
            router.register_rule(rule, &["*"]);
        }
    }

    Harness {
        router,
        local_runs,
        dispatched,
    }
}

fn route(h: &Harness, policy: DispatchPolicy) -> Option<Value> {
    let mut subject = h.router.subject("order|1").unwrap();
    h.router
        .route("order-placed", &mut subject, Payload::new(), policy)
        .unwrap()
}

#[test]
fn truth_table() {
    // (policy, handlers, local rule runs, dispatched)
    let cases = [
        (DispatchPolicy::Default, Handlers::None, 0, true),
        (DispatchPolicy::Default, Handlers::Exact, 1, false),
        (DispatchPolicy::Default, Handlers::WildcardOnly, 1, true),
        (DispatchPolicy::Always, Handlers::None, 0, true),
        (DispatchPolicy::Always, Handlers::Exact, 1, true),
        (DispatchPolicy::Always, Handlers::WildcardOnly, 1, true),
        (DispatchPolicy::Never, Handlers::None, 0, false),
        (DispatchPolicy::Never, Handlers::Exact, 1, false),
        (DispatchPolicy::Never, Handlers::WildcardOnly, 1, false),
        (DispatchPolicy::Direct, Handlers::None, 0, true),
        (DispatchPolicy::Direct, Handlers::Exact, 0, true),
        (DispatchPolicy::Direct, Handlers::WildcardOnly, 0, true),
    ];

    for (policy, handlers, runs, dispatched) in cases {
        let h = harness(handlers);
        let result = route(&h, policy);
        let label = format!("{policy:?} with {handlers:?}");
        assert_eq!(h.local_runs.load(Ordering::SeqCst), runs, "{label}");
        assert_eq!(result.is_some(), dispatched, "{label}");
        assert_eq!(h.dispatched.lock().unwrap().len(), usize::from(dispatched), "{label}");
        if dispatched {
            assert_eq!(result, Some(json!("dispatched")), "{label}");
            assert_eq!(h.dispatched.lock().unwrap()[0], "order-placed@order|1", "{label}");
        }
    }
}

#[test]
fn dispatch_failure_reaches_the_caller_after_local_changes() {
    let router = EventRouter::builder()
        .dispatcher(|_: &str, _: &Subject, _: &Payload, _: &Payload| {
            Err::<Value, _>(DispatchError::Rejected {
                status: 503,
                message: "broker down".to_string(),
            })
        })
        .build();
    router.register_rule(
        Rule::builder("mark")
            .processing(Callable::new("mark", |ctx| {
                ctx.subject.set_muted("handled", true)?;
                Ok(Value::Null)
            }))
            .build(),
        &["order-placed"],
    );

    let mut subject = router.subject("order|2").unwrap();
    let err = router
        .route("order-placed", &mut subject, Payload::new(), DispatchPolicy::Always)
        .unwrap_err();
    assert!(matches!(err, RouterError::Dispatch(DispatchError::Rejected { status: 503, .. })));
    assert_eq!(subject.get("handled").unwrap(), json!(true));
}

#[test]
fn unregistering_restores_default_dispatch() {
    let h = harness(Handlers::Exact);
    assert_eq!(route(&h, DispatchPolicy::Default), None);
    assert_eq!(h.router.unregister("order-placed"), 1);
    assert_eq!(route(&h, DispatchPolicy::Default), Some(json!("dispatched")));
    assert_eq!(h.local_runs.load(Ordering::SeqCst), 1);
}
