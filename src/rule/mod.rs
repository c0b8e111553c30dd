//! Rules: ordered filters followed by ordered processing steps.
//!
//! A rule runs its filters until one returns a falsy value, then its
//! processing steps in order. A failing step stops the rule; the failure is
//! logged and recorded in the rule's proc event but never reaches the caller
//! of `route`, so the next rule still runs.
//!
//! ```
//! use ruleflow::rule::{processing::SetSubjectProperty, filters::PayloadMatch, Rule};
//! use ruleflow::{DispatchPolicy, EventRouter, Payload};
//! use serde_json::json;
//!
//! let router = EventRouter::builder().build();
//! router.register_rule(
//!     Rule::builder("on-reading")
//!         .description("remember the latest temperature")
//!         .filter(PayloadMatch::new("/temp", ruleflow::rule::filters::ValueMatcher::Any))
//!         .processing(SetSubjectProperty::new("temp", ruleflow::rule::Arg::with_payload(|p| p["temp"].clone())))
//!         .build(),
//!     &["reading"],
//! );
//!
//! let mut subject = router.subject("sensor|1").unwrap();
//! let mut payload = Payload::new();
//! payload.insert("temp".into(), json!(21));
//! router.route("reading", &mut subject, payload, DispatchPolicy::Never).unwrap();
//! assert_eq!(subject.get("temp").unwrap(), json!(21));
//! ```

mod args;
mod context;
pub mod filters;
mod function;
pub mod processing;

use std::fmt;

use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::error::{RuleError, RuleResult};
use crate::proc_event::{Section, Tracer};
use crate::router::EventRouter;
use crate::subject::Subject;
use crate::value::{is_truthy, Payload};

pub use args::Arg;
pub use context::RuleContext;
pub use function::{Callable, RuleFunction};

/// Result of one rule handling one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleOutcome {
    /// Every filter passed.
    pub passed: bool,
    /// A filter or processing step failed.
    pub got_errors: bool,
}

/// A named rule.
pub struct Rule {
    name: String,
    description: Option<String>,
    filters: Vec<Box<dyn RuleFunction>>,
    processing: Vec<Box<dyn RuleFunction>>,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |steps: &[Box<dyn RuleFunction>]| steps.iter().map(|s| s.name().to_string()).collect::<Vec<_>>();
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("filters", &names(&self.filters))
            .field("processing", &names(&self.processing))
            .finish()
    }
}

/// Builder for [`Rule`].
pub struct RuleBuilder {
    rule: Rule,
}

impl RuleBuilder {
    /// Human-readable description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.rule.description = Some(description.into());
        self
    }

    /// Append a filter.
    #[must_use]
    pub fn filter(mut self, f: impl RuleFunction + 'static) -> Self {
        self.rule.filters.push(Box::new(f));
        self
    }

    /// Append a processing step.
    #[must_use]
    pub fn processing(mut self, f: impl RuleFunction + 'static) -> Self {
        self.rule.processing.push(Box::new(f));
        self
    }

    /// Finish the rule.
    #[must_use]
    pub fn build(self) -> Rule {
        self.rule
    }
}

impl Rule {
    /// Start building a rule called `name`.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> RuleBuilder {
        RuleBuilder {
            rule: Self {
                name: name.into(),
                description: None,
                filters: Vec::new(),
                processing: Vec::new(),
            },
        }
    }

    /// Rule name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Description, if one was given.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Handle one event. Never fails: step errors are logged, recorded in the
    /// proc event and reported through the outcome.
    pub fn process(
        &self,
        event_type: &str,
        subject: &mut Subject,
        payload: &mut Payload,
        router: &EventRouter,
    ) -> RuleOutcome {
        let mut tracer = Tracer::start(
            router.config().proc_events_level,
            router.wants_proc_events(),
            &self.name,
            event_type,
            subject.name(),
            payload,
            subject.event_info(),
        );
        let recording = tracer.is_some();
        let mut outcome = RuleOutcome {
            passed: true,
            got_errors: false,
        };

        for f in &self.filters {
            let (result, args) = self.run(f.as_ref(), event_type, subject, payload, router, recording);
            match result {
                Ok(value) => {
                    let pass = is_truthy(&value);
                    if let Some(t) = tracer.as_mut() {
                        t.step(Section::Filters, f.name(), args, value, payload);
                    }
                    if !pass {
                        outcome.passed = false;
                        break;
                    }
                }
                Err(err) => {
                    self.report(event_type, subject.name(), f.name(), &err);
                    if let Some(t) = tracer.as_mut() {
                        t.fail(Section::Filters, f.name(), args, &err, payload);
                    }
                    outcome.passed = false;
                    outcome.got_errors = true;
                    break;
                }
            }
        }

        if outcome.passed {
            for f in &self.processing {
                let (result, args) = self.run(f.as_ref(), event_type, subject, payload, router, recording);
                match result {
                    Ok(value) => {
                        if let Some(t) = tracer.as_mut() {
                            t.step(Section::Processing, f.name(), args, value, payload);
                        }
                    }
                    Err(err) => {
                        self.report(event_type, subject.name(), f.name(), &err);
                        if let Some(t) = tracer.as_mut() {
                            t.fail(Section::Processing, f.name(), args, &err, payload);
                        }
                        outcome.got_errors = true;
                        break;
                    }
                }
            }
        }

        debug!(
            rule = %self.name,
            event_type,
            subject = subject.name(),
            passed = outcome.passed,
            got_errors = outcome.got_errors,
            "rule processed"
        );
        if let Some(t) = tracer {
            router.publish_proc_event(t.finish(outcome.passed, outcome.got_errors, payload));
        }
        outcome
    }

    fn run(
        &self,
        f: &dyn RuleFunction,
        event_type: &str,
        subject: &mut Subject,
        payload: &mut Payload,
        router: &EventRouter,
        recording: bool,
    ) -> (RuleResult, Map<String, Value>) {
        let mut ctx = RuleContext::new(event_type, subject, payload, router, &self.name, recording);
        let result = f.execute(&mut ctx);
        (result, ctx.into_args())
    }

    fn report(&self, event_type: &str, subject: &str, function: &str, err: &RuleError) {
        if err.is_abort() {
            warn!(rule = %self.name, event_type, subject, function, error = %err, "rule aborted");
        } else {
            error!(
                rule = %self.name,
                event_type,
                subject,
                function,
                exception = err.exception_name(),
                error = %err,
                "rule function failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProcEventsLevel, RouterConfig};
    use serde_json::json;

    fn step(name: &str, result: RuleResult) -> Callable<impl Fn(&mut RuleContext<'_>) -> RuleResult> {
        let label = name.to_string();
        let value = match result {
            Ok(v) => Ok(v),
            Err(e) => Err(e.to_string()),
        };
        Callable::new(name, move |ctx| {
            let mut seen = ctx.payload.get("seen").cloned().unwrap_or_else(|| json!([]));
            if let Some(list) = seen.as_array_mut() {
                list.push(json!(label.clone()));
            }
            ctx.payload.insert("seen".into(), seen);
            value.clone().map_err(|m| RuleError::failed("TestError", m))
        })
    }

    fn seen(payload: &Payload) -> Value {
        payload.get("seen").cloned().unwrap_or_else(|| json!([]))
    }

    fn router(level: ProcEventsLevel) -> EventRouter {
        EventRouter::builder()
            .config(RouterConfig {
                proc_events_level: level,
                ..RouterConfig::default()
            })
            .build()
    }

    #[test]
    fn falsy_filter_short_circuits() {
        let rule = Rule::builder("r")
            .filter(step("f1", Ok(json!(true))))
            .filter(step("f2", Ok(json!(0))))
            .filter(step("f3", Ok(json!(true))))
            .processing(step("p1", Ok(Value::Null)))
            .build();
        let router = router(ProcEventsLevel::Disabled);
        let mut subject = router.subject("s").unwrap();
        let mut payload = Payload::new();

        let outcome = rule.process("e", &mut subject, &mut payload, &router);
        assert_eq!(outcome, RuleOutcome { passed: false, got_errors: false });
        assert_eq!(seen(&payload), json!(["f1", "f2"]));
    }

    #[test]
    fn processing_error_stops_the_rule() {
        let rule = Rule::builder("r")
            .processing(step("p1", Ok(Value::Null)))
            .processing(step("p2", Err(RuleError::failed("x", "boom"))))
            .processing(step("p3", Ok(Value::Null)))
            .build();
        let router = router(ProcEventsLevel::Disabled);
        let mut subject = router.subject("s").unwrap();
        let mut payload = Payload::new();

        let outcome = rule.process("e", &mut subject, &mut payload, &router);
        assert_eq!(outcome, RuleOutcome { passed: true, got_errors: true });
        assert_eq!(seen(&payload), json!(["p1", "p2"]));
    }

    #[test]
    fn filter_error_counts_as_not_passed() {
        let rule = Rule::builder("r")
            .filter(step("f1", Err(RuleError::abort("no"))))
            .processing(step("p1", Ok(Value::Null)))
            .build();
        let router = router(ProcEventsLevel::Disabled);
        let mut subject = router.subject("s").unwrap();
        let mut payload = Payload::new();

        let outcome = rule.process("e", &mut subject, &mut payload, &router);
        assert_eq!(outcome, RuleOutcome { passed: false, got_errors: true });
        assert_eq!(seen(&payload), json!(["f1"]));
    }

    #[test]
    fn proc_event_published_only_when_observed() {
        let rule = Rule::builder("traced")
            .description("d")
            .filter(step("f1", Ok(json!("yes"))))
            .processing(step("p1", Ok(json!(7))))
            .build();
        let router = router(ProcEventsLevel::Light);
        let mut subject = router.subject("s").unwrap();

        let mut payload = Payload::new();
        rule.process("e", &mut subject, &mut payload, &router);
        assert_eq!(router.proc_events().published(), 0);

        let stream = router.subscribe_proc_events();
        let mut payload = Payload::new();
        rule.process("e", &mut subject, &mut payload, &router);
        let event = stream.try_recv().unwrap();
        assert_eq!(event.rule_name, "traced");
        assert_eq!(event.filters[0].returns, json!("yes"));
        assert_eq!(event.processing[0].returns, json!(7));
        assert!(event.passed);
        assert_eq!(event.payload["seen"], json!(["f1", "p1"]));
    }
}
