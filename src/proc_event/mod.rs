//! Diagnostic records of rule executions.
//!
//! Every time a rule handles an event it can publish a [`ProcEvent`]
//! describing what each filter and processing step received and returned.
//! Records are only built when the configured [`ProcEventsLevel`] enables them
//! and somebody consumes them, either a [`ProcEventBus`] subscriber or the
//! router's [`ProcEventRouting`]; nothing in the engine depends on them.
//!
//! Under [`ProcEventsLevel::Full`] the record's `payload` is the payload the
//! rule received and every step carries the structural diff it applied, so
//! the payload can be replayed step by step. Under
//! [`ProcEventsLevel::Light`] the record holds the final payload only.
//!
//! Besides the in-process stream, selected records can be routed back through
//! the router as [`RULE_PROC_EVENT`] events, typically to ship failures to a
//! remote collector. See [`ProcEventRouting`].

pub mod diff;
mod routing;
mod stream;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::ProcEventsLevel;
use crate::error::RuleError;
use crate::value::Payload;

pub use diff::PatchOp;
pub use routing::{ProcEventPredicate, ProcEventRouting, RULE_PROC_EVENT};
pub use stream::{ProcEventBus, ProcEventStream, RecvError};

/// Rule section a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    /// Rule filters.
    Filters,
    /// Rule processing steps.
    Processing,
}

/// One filter or processing step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Rule function name.
    pub function: String,
    /// Arguments as resolved right before the call.
    pub args: Map<String, Value>,
    /// Returned value; `null` when the step failed.
    pub returns: Value,
    /// Payload changes made by the step (full tracing only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_diffs: Option<Vec<PatchOp>>,
    /// Whether the step failed.
    #[serde(default)]
    pub error: bool,
}

/// Failure details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Section the failing step belongs to.
    pub section: Section,
    /// Failing rule function.
    pub function: String,
    /// Error class name, e.g. `RuleAbort` or `WriteConflict`.
    pub exception: String,
    /// The error and its sources.
    pub exc_info: Vec<String>,
    /// Structured, error-specific details.
    pub extra: Value,
}

/// What happened when one rule handled one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcEvent {
    /// Unique id of this execution.
    pub process_id: Uuid,
    /// Rule that ran.
    pub rule_name: String,
    /// Event type that triggered the rule.
    pub event_type: String,
    /// Subject name.
    pub subject: String,
    /// Initial payload under full tracing, final payload otherwise.
    pub payload: Payload,
    /// Inbound event attributes carried by the subject.
    pub event_info: Payload,
    /// Filter steps, in order.
    pub filters: Vec<StepRecord>,
    /// Processing steps, in order.
    pub processing: Vec<StepRecord>,
    /// Every filter passed.
    pub passed: bool,
    /// A step failed.
    pub got_errors: bool,
    /// Set when `got_errors` is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    /// When the rule finished.
    pub timestamp: DateTime<Utc>,
}

impl ProcEvent {
    /// Empty record for a rule about to run.
    pub fn new(
        rule_name: impl Into<String>,
        event_type: impl Into<String>,
        subject: impl Into<String>,
        payload: Payload,
        event_info: Payload,
    ) -> Self {
        Self {
            process_id: Uuid::new_v4(),
            rule_name: rule_name.into(),
            event_type: event_type.into(),
            subject: subject.into(),
            payload,
            event_info,
            filters: Vec::new(),
            processing: Vec::new(),
            passed: false,
            got_errors: false,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Steps of a section.
    #[must_use]
    pub fn steps(&self, section: Section) -> &[StepRecord] {
        match section {
            Section::Filters => &self.filters,
            Section::Processing => &self.processing,
        }
    }
}

/// Builds a [`ProcEvent`] while a rule runs.
pub(crate) struct Tracer {
    event: ProcEvent,
    full: bool,
    last_payload: Payload,
}

impl Tracer {
    /// Start recording, or `None` when records are not wanted.
    pub(crate) fn start(
        level: ProcEventsLevel,
        listening: bool,
        rule_name: &str,
        event_type: &str,
        subject: &str,
        payload: &Payload,
        event_info: &Payload,
    ) -> Option<Self> {
        if !level.is_enabled() || !listening {
            return None;
        }
        let full = level == ProcEventsLevel::Full;
        Some(Self {
            event: ProcEvent::new(rule_name, event_type, subject, payload.clone(), event_info.clone()),
            full,
            last_payload: payload.clone(),
        })
    }

    fn diffs(&mut self, payload: &Payload) -> Option<Vec<PatchOp>> {
        if !self.full {
            return None;
        }
        let ops = diff::diff_payloads(&self.last_payload, payload);
        self.last_payload = payload.clone();
        Some(ops)
    }

    fn push(&mut self, section: Section, record: StepRecord) {
        match section {
            Section::Filters => self.event.filters.push(record),
            Section::Processing => self.event.processing.push(record),
        }
    }

    pub(crate) fn step(
        &mut self,
        section: Section,
        function: &str,
        args: Map<String, Value>,
        returns: Value,
        payload: &Payload,
    ) {
        let payload_diffs = self.diffs(payload);
        self.push(
            section,
            StepRecord {
                function: function.to_string(),
                args,
                returns,
                payload_diffs,
                error: false,
            },
        );
    }

    pub(crate) fn fail(
        &mut self,
        section: Section,
        function: &str,
        args: Map<String, Value>,
        err: &RuleError,
        payload: &Payload,
    ) {
        let payload_diffs = self.diffs(payload);
        self.push(
            section,
            StepRecord {
                function: function.to_string(),
                args,
                returns: Value::Null,
                payload_diffs,
                error: true,
            },
        );
        self.event.error = Some(ErrorRecord {
            section,
            function: function.to_string(),
            exception: err.exception_name().to_string(),
            exc_info: err.trace(),
            extra: err.extra_info(),
        });
    }

    pub(crate) fn finish(mut self, passed: bool, got_errors: bool, payload: &Payload) -> ProcEvent {
        self.event.passed = passed;
        self.event.got_errors = got_errors;
        if !self.full {
            self.event.payload = payload.clone();
        }
        self.event
    }
}
