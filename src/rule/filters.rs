//! Built-in filters.

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::RuleResult;
use crate::rule::args::Arg;
use crate::rule::context::RuleContext;
use crate::rule::function::RuleFunction;
use crate::subject::property::PropertyKind;
use crate::subject::{OLD_VALUE, PROPERTY_NAME, SUBJECT_PROPERTY_CHANGED, VALUE};
use crate::value::payload_pointer;

type Predicate = dyn Fn(&Value) -> bool + Send + Sync;

/// Test applied to a value.
#[derive(Clone, Default)]
pub enum ValueMatcher {
    /// Anything, as long as the value exists.
    #[default]
    Any,
    /// Equal to the given value.
    Equals(Value),
    /// Accepted by the predicate.
    Predicate(Arc<Predicate>),
}

impl ValueMatcher {
    /// Accept values the predicate accepts.
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    /// Whether `value` is accepted.
    #[must_use]
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::Equals(expected) => expected == value,
            Self::Predicate(f) => f(value),
        }
    }

    fn describe(&self) -> Value {
        match self {
            Self::Any => Value::from("*"),
            Self::Equals(v) => v.clone(),
            Self::Predicate(_) => Value::from("<predicate>"),
        }
    }
}

impl fmt::Debug for ValueMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("Any"),
            Self::Equals(v) => f.debug_tuple("Equals").field(v).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

macro_rules! matcher_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for ValueMatcher {
                fn from(value: $ty) -> Self {
                    Self::Equals(Value::from(value))
                }
            }
        )*
    };
}

matcher_from!(Value, bool, i32, i64, u64, f64, &str, String);

/// Passes when the argument resolves to a truthy value.
#[derive(Debug, Clone)]
pub struct Filter {
    value: Arg<Value>,
}

impl Filter {
    /// Pass when `value` is truthy.
    pub fn new(value: impl Into<Arg<Value>>) -> Self {
        Self { value: value.into() }
    }
}

impl RuleFunction for Filter {
    fn name(&self) -> &str {
        "Filter"
    }

    fn execute(&self, ctx: &mut RuleContext<'_>) -> RuleResult {
        self.value.resolve_as(ctx, "value")
    }
}

/// Passes when the subject name matches a regular expression.
///
/// Named capture groups are written to the payload, as an object under
/// `subject_match` unless another key is chosen.
#[derive(Debug, Clone)]
pub struct SubjectNameMatch {
    regex: Regex,
    payload_dest: String,
}

impl SubjectNameMatch {
    /// Compile `pattern`.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
            payload_dest: "subject_match".to_string(),
        })
    }

    /// Payload key receiving the named groups.
    #[must_use]
    pub fn payload_dest(mut self, key: impl Into<String>) -> Self {
        self.payload_dest = key.into();
        self
    }
}

impl RuleFunction for SubjectNameMatch {
    fn name(&self) -> &str {
        "SubjectNameMatch"
    }

    fn execute(&self, ctx: &mut RuleContext<'_>) -> RuleResult {
        ctx.record_arg("regex", &self.regex.as_str());
        let groups = self.regex.captures(ctx.subject.name()).map(|caps| {
            self.regex
                .capture_names()
                .flatten()
                .filter_map(|name| caps.name(name).map(|m| (name.to_string(), Value::from(m.as_str()))))
                .collect::<Map<String, Value>>()
        });
        match groups {
            Some(groups) => {
                ctx.payload.insert(self.payload_dest.clone(), Value::Object(groups));
                Ok(Value::Bool(true))
            }
            None => Ok(Value::Bool(false)),
        }
    }
}

/// Passes when the subject name does not match a regular expression.
#[derive(Debug, Clone)]
pub struct SubjectNameDoesNotMatch {
    regex: Regex,
}

impl SubjectNameDoesNotMatch {
    /// Compile `pattern`.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
        })
    }
}

impl RuleFunction for SubjectNameDoesNotMatch {
    fn name(&self) -> &str {
        "SubjectNameDoesNotMatch"
    }

    fn execute(&self, ctx: &mut RuleContext<'_>) -> RuleResult {
        ctx.record_arg("regex", &self.regex.as_str());
        Ok(Value::Bool(!self.regex.is_match(ctx.subject.name())))
    }
}

/// Passes when a subject property exists and matches.
#[derive(Debug, Clone)]
pub struct CheckSubjectProperty {
    property_name: String,
    matcher: ValueMatcher,
    kind: PropertyKind,
    use_cache: Option<bool>,
}

impl CheckSubjectProperty {
    /// Passes when the default property `name` exists.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            property_name: name.into(),
            matcher: ValueMatcher::Any,
            kind: PropertyKind::Default,
            use_cache: None,
        }
    }

    /// Additionally require the value to match.
    #[must_use]
    pub fn value(mut self, matcher: impl Into<ValueMatcher>) -> Self {
        self.matcher = matcher.into();
        self
    }

    /// Check the extended property of that name.
    #[must_use]
    pub fn extended(mut self) -> Self {
        self.kind = PropertyKind::Extended;
        self
    }

    /// Read through (`true`) or around (`false`) the cache.
    #[must_use]
    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = Some(use_cache);
        self
    }
}

impl RuleFunction for CheckSubjectProperty {
    fn name(&self) -> &str {
        "CheckSubjectProperty"
    }

    fn execute(&self, ctx: &mut RuleContext<'_>) -> RuleResult {
        ctx.record_arg("property_name", &self.property_name);
        ctx.record_arg("property_value", &self.matcher.describe());
        match ctx.subject.get_property(&self.property_name, self.kind, self.use_cache) {
            Ok(value) => Ok(Value::Bool(self.matcher.matches(&value))),
            Err(err) if err.is_not_found() => Ok(Value::Bool(false)),
            Err(err) => Err(err.into()),
        }
    }
}

/// Passes for `subject-property-changed` events matching the property name
/// and, optionally, the new and old values.
#[derive(Debug, Clone)]
pub struct OnSubjectPropertyChanged {
    property_name: ValueMatcher,
    value: ValueMatcher,
    old_value: ValueMatcher,
}

impl OnSubjectPropertyChanged {
    /// Changes of properties matching `name`.
    pub fn new(name: impl Into<ValueMatcher>) -> Self {
        Self {
            property_name: name.into(),
            value: ValueMatcher::Any,
            old_value: ValueMatcher::Any,
        }
    }

    /// Changes of any property.
    #[must_use]
    pub fn any() -> Self {
        Self::new(ValueMatcher::Any)
    }

    /// Require the new value to match.
    #[must_use]
    pub fn value(mut self, matcher: impl Into<ValueMatcher>) -> Self {
        self.value = matcher.into();
        self
    }

    /// Require the previous value to match.
    #[must_use]
    pub fn old_value(mut self, matcher: impl Into<ValueMatcher>) -> Self {
        self.old_value = matcher.into();
        self
    }
}

impl RuleFunction for OnSubjectPropertyChanged {
    fn name(&self) -> &str {
        "OnSubjectPropertyChanged"
    }

    fn execute(&self, ctx: &mut RuleContext<'_>) -> RuleResult {
        ctx.record_arg("property_name", &self.property_name.describe());
        if ctx.event_type != SUBJECT_PROPERTY_CHANGED {
            return Ok(Value::Bool(false));
        }
        let field = |key: &str| ctx.payload.get(key).cloned().unwrap_or(Value::Null);
        let matched = self.property_name.matches(&field(PROPERTY_NAME))
            && self.value.matches(&field(VALUE))
            && self.old_value.matches(&field(OLD_VALUE));
        Ok(Value::Bool(matched))
    }
}

/// Passes when the value at a JSON pointer into the payload exists and
/// matches. The matched value can be copied to another payload key.
#[derive(Debug, Clone)]
pub struct PayloadMatch {
    pointer: String,
    matcher: ValueMatcher,
    payload_dest: Option<String>,
}

impl PayloadMatch {
    /// Match the value at `pointer`, e.g. `/user/name`.
    pub fn new(pointer: impl Into<String>, matcher: impl Into<ValueMatcher>) -> Self {
        Self {
            pointer: pointer.into(),
            matcher: matcher.into(),
            payload_dest: None,
        }
    }

    /// Copy the matched value to this payload key.
    #[must_use]
    pub fn payload_dest(mut self, key: impl Into<String>) -> Self {
        self.payload_dest = Some(key.into());
        self
    }
}

impl RuleFunction for PayloadMatch {
    fn name(&self) -> &str {
        "PayloadMatch"
    }

    fn execute(&self, ctx: &mut RuleContext<'_>) -> RuleResult {
        ctx.record_arg("pointer", &self.pointer);
        ctx.record_arg("match_value", &self.matcher.describe());
        let found = payload_pointer(ctx.payload, &self.pointer)
            .filter(|v| self.matcher.matches(v))
            .cloned();
        match found {
            Some(value) => {
                if let Some(dest) = &self.payload_dest {
                    ctx.payload.insert(dest.clone(), value);
                }
                Ok(Value::Bool(true))
            }
            None => Ok(Value::Bool(false)),
        }
    }
}
