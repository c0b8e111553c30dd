//! Selection of proc events routed back through the router.
//!
//! A router built with [`ProcEventRouting`] routes every selected record as a
//! [`RULE_PROC_EVENT`] event about a subject named after the rule, with the
//! serialized record as payload. Records are dispatched directly, so routing
//! them runs no local rule and produces no further record, unless
//! [`ProcEventRouting::local`] hands them to local rules first.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::ProcEvent;
use crate::config::ENV_PROCEVENTS_MATCHING;
use crate::error::ConfigError;
use crate::router::DispatchPolicy;

/// Event type of routed proc events.
pub const RULE_PROC_EVENT: &str = "rule-proc-event";

/// Predicate over proc events.
pub type ProcEventPredicate = dyn Fn(&ProcEvent) -> bool + Send + Sync;

#[derive(Clone)]
enum Selection {
    All,
    Errors,
    Filtered(Arc<ProcEventPredicate>),
    Matching(Vec<(String, Value)>),
}

/// Which proc events are routed as [`RULE_PROC_EVENT`], and how.
#[derive(Clone)]
pub struct ProcEventRouting {
    selection: Selection,
    local: bool,
}

impl fmt::Debug for ProcEventRouting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let selection = match &self.selection {
            Selection::All => "all".to_string(),
            Selection::Errors => "errors".to_string(),
            Selection::Filtered(_) => "filtered".to_string(),
            Selection::Matching(fields) => format!("matching {fields:?}"),
        };
        f.debug_struct("ProcEventRouting")
            .field("selection", &selection)
            .field("local", &self.local)
            .finish()
    }
}

impl ProcEventRouting {
    const fn new(selection: Selection) -> Self {
        Self {
            selection,
            local: false,
        }
    }

    /// Route every record.
    #[must_use]
    pub const fn all() -> Self {
        Self::new(Selection::All)
    }

    /// Route records of rules that failed.
    #[must_use]
    pub const fn errors() -> Self {
        Self::new(Selection::Errors)
    }

    /// Route records accepted by `predicate`.
    #[must_use]
    pub fn filtered<F>(predicate: F) -> Self
    where
        F: Fn(&ProcEvent) -> bool + Send + Sync + 'static,
    {
        Self::new(Selection::Filtered(Arc::new(predicate)))
    }

    /// Route records whose serialized fields equal the given values.
    ///
    /// `expr` is a `;`-separated list of `field=value` terms, all of which
    /// must hold. Dots in `field` descend into nested objects. `value` is read
    /// as JSON when it parses, as a string otherwise.
    ///
    /// ```
    /// use ruleflow::proc_event::ProcEventRouting;
    ///
    /// assert!(ProcEventRouting::matching("passed=true; error.exception=ValueError").is_ok());
    /// assert!(ProcEventRouting::matching("passed").is_err());
    /// ```
    ///
    /// # Errors
    /// - `InvalidValue`: if a term has no `=` or an empty field
    pub fn matching(expr: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: ENV_PROCEVENTS_MATCHING.to_string(),
            value: expr.to_string(),
        };
        let mut fields = Vec::new();
        for term in expr.split(';').map(str::trim).filter(|t| !t.is_empty()) {
            let (field, value) = term.split_once('=').ok_or_else(invalid)?;
            let field = field.trim();
            if field.is_empty() {
                return Err(invalid());
            }
            let value = value.trim();
            let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
            fields.push((format!("/{}", field.replace('.', "/")), value));
        }
        if fields.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(Selection::Matching(fields)))
    }

    /// Run local [`RULE_PROC_EVENT`] rules on selected records instead of
    /// dispatching them. Records produced by those rules are still
    /// dispatched directly.
    #[must_use]
    pub const fn local(mut self) -> Self {
        self.local = true;
        self
    }

    /// Whether `event` is routed. `record` is its serialized form.
    #[must_use]
    pub fn selects(&self, event: &ProcEvent, record: &Value) -> bool {
        match &self.selection {
            Selection::All => true,
            Selection::Errors => event.got_errors,
            Selection::Filtered(predicate) => predicate(event),
            Selection::Matching(fields) => fields
                .iter()
                .all(|(pointer, expected)| record.pointer(pointer) == Some(expected)),
        }
    }

    /// Policy used to route `event`.
    #[must_use]
    pub fn policy(&self, event: &ProcEvent) -> DispatchPolicy {
        if self.local && event.event_type != RULE_PROC_EVENT {
            DispatchPolicy::Never
        } else {
            DispatchPolicy::Direct
        }
    }
}
