use serde::Serialize;
use serde_json::{Map, Value};

use crate::router::EventRouter;
use crate::subject::Subject;
use crate::value::Payload;

/// What a rule function sees while it runs.
///
/// Borrowed from the router for one step; the payload is shared by every rule
/// handling the same event, so changes made by one rule are visible to the
/// next.
pub struct RuleContext<'a> {
    /// Type of the event being handled.
    pub event_type: &'a str,
    /// Subject the event is about.
    pub subject: &'a mut Subject,
    /// Event payload.
    pub payload: &'a mut Payload,
    /// Router handling the event, for routing further events.
    pub router: &'a EventRouter,
    /// Name of the running rule.
    pub rule_name: &'a str,
    args: Map<String, Value>,
    recording: bool,
}

impl<'a> RuleContext<'a> {
    pub(crate) fn new(
        event_type: &'a str,
        subject: &'a mut Subject,
        payload: &'a mut Payload,
        router: &'a EventRouter,
        rule_name: &'a str,
        recording: bool,
    ) -> Self {
        Self {
            event_type,
            subject,
            payload,
            router,
            rule_name,
            args: Map::new(),
            recording,
        }
    }

    /// Record a resolved argument for the proc event of this execution. A
    /// no-op when no proc event is being built.
    pub fn record_arg(&mut self, name: &str, value: &impl Serialize) {
        if self.recording {
            let value = serde_json::to_value(value).unwrap_or(Value::Null);
            self.args.insert(name.to_string(), value);
        }
    }

    /// Whether a proc event is being built.
    #[must_use]
    pub const fn is_recording(&self) -> bool {
        self.recording
    }

    pub(crate) fn into_args(self) -> Map<String, Value> {
        self.args
    }
}
