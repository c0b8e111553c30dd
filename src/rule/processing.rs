//! Built-in processing functions.

use serde_json::{Map, Value};

use crate::error::{RuleError, RuleResult};
use crate::router::DispatchPolicy;
use crate::rule::args::Arg;
use crate::rule::context::RuleContext;
use crate::rule::function::RuleFunction;
use crate::subject::property::{PropertyKind, PropertyValue};

fn object_arg(name: &str, value: Value) -> Result<Map<String, Value>, RuleError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(RuleError::InvalidArgument {
            name: name.to_string(),
            message: format!("expected an object, got {other}"),
        }),
    }
}

/// Runs an argument for its side effects and returns its value.
#[derive(Debug, Clone)]
pub struct Process {
    value: Arg<Value>,
}

impl Process {
    /// Run `value` and return it.
    pub fn new(value: impl Into<Arg<Value>>) -> Self {
        Self { value: value.into() }
    }
}

impl RuleFunction for Process {
    fn name(&self) -> &str {
        "Process"
    }

    fn execute(&self, ctx: &mut RuleContext<'_>) -> RuleResult {
        self.value.resolve(ctx)
    }
}

/// Sets one payload key.
#[derive(Debug, Clone)]
pub struct SetPayloadProperty {
    property_name: String,
    value: Arg<Value>,
}

impl SetPayloadProperty {
    /// Set `name` on the payload.
    pub fn new(name: impl Into<String>, value: impl Into<Arg<Value>>) -> Self {
        Self {
            property_name: name.into(),
            value: value.into(),
        }
    }
}

impl RuleFunction for SetPayloadProperty {
    fn name(&self) -> &str {
        "SetPayloadProperty"
    }

    fn execute(&self, ctx: &mut RuleContext<'_>) -> RuleResult {
        ctx.record_arg("property_name", &self.property_name);
        let value = self.value.resolve_as(ctx, "value")?;
        ctx.payload.insert(self.property_name.clone(), value.clone());
        Ok(value)
    }
}

/// Merges an object into the payload, key by key.
#[derive(Debug, Clone)]
pub struct SetPayloadProperties {
    props: Arg<Value>,
}

impl SetPayloadProperties {
    /// Merge `props` into the payload.
    pub fn new(props: impl Into<Arg<Value>>) -> Self {
        Self { props: props.into() }
    }
}

impl RuleFunction for SetPayloadProperties {
    fn name(&self) -> &str {
        "SetPayloadProperties"
    }

    fn execute(&self, ctx: &mut RuleContext<'_>) -> RuleResult {
        let props = object_arg("props", self.props.resolve_as(ctx, "props")?)?;
        for (key, value) in &props {
            ctx.payload.insert(key.clone(), value.clone());
        }
        Ok(Value::Object(props))
    }
}

#[derive(Debug, Clone)]
enum NewValue {
    Arg(Arg<Value>),
    Update(PropertyValue),
}

/// Writes one subject property and returns the new value.
///
/// Writes to default properties route `subject-property-changed` unless
/// muted. [`SetSubjectProperty::update`] computes the value from the current
/// one atomically.
#[derive(Debug, Clone)]
pub struct SetSubjectProperty {
    property_name: String,
    value: NewValue,
    kind: PropertyKind,
    muted: bool,
    use_cache: Option<bool>,
}

impl SetSubjectProperty {
    /// Write `value` to the default property `name`.
    pub fn new(name: impl Into<String>, value: impl Into<Arg<Value>>) -> Self {
        Self {
            property_name: name.into(),
            value: NewValue::Arg(value.into()),
            kind: PropertyKind::Default,
            muted: false,
            use_cache: None,
        }
    }

    /// Write `f(current)`; a missing property reads as `null`.
    pub fn update<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Self {
            value: NewValue::Update(PropertyValue::update(f)),
            ..Self::new(name, Value::Null)
        }
    }

    /// Write the extended property instead.
    #[must_use]
    pub fn extended(mut self) -> Self {
        self.kind = PropertyKind::Extended;
        self
    }

    /// Do not route a change event.
    #[must_use]
    pub fn muted(mut self) -> Self {
        self.muted = true;
        self
    }

    /// Write through the cache (`true`) or straight to storage (`false`).
    #[must_use]
    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = Some(use_cache);
        self
    }
}

impl RuleFunction for SetSubjectProperty {
    fn name(&self) -> &str {
        "SetSubjectProperty"
    }

    fn execute(&self, ctx: &mut RuleContext<'_>) -> RuleResult {
        ctx.record_arg("property_name", &self.property_name);
        ctx.record_arg("extended", &(self.kind == PropertyKind::Extended));
        ctx.record_arg("muted", &self.muted);
        let value = match &self.value {
            NewValue::Arg(arg) => PropertyValue::Value(arg.resolve_as(ctx, "value")?),
            NewValue::Update(update) => update.clone(),
        };
        let (new, _old) =
            ctx.subject
                .set_property(&self.property_name, value, self.kind, self.muted, self.use_cache)?;
        Ok(new)
    }
}

#[derive(Debug, Clone)]
enum Unmuted {
    Names(Vec<String>),
    All,
}

/// Writes several default properties from an object.
///
/// Every write is muted except those named by [`SetSubjectProperties::unmuted`].
#[derive(Debug, Clone)]
pub struct SetSubjectProperties {
    props: Arg<Value>,
    unmuted: Unmuted,
    use_cache: Option<bool>,
}

impl SetSubjectProperties {
    /// Set every property in `props` on the subject.
    pub fn new(props: impl Into<Arg<Value>>) -> Self {
        Self {
            props: props.into(),
            unmuted: Unmuted::Names(Vec::new()),
            use_cache: None,
        }
    }

    /// Route change events for these properties.
    #[must_use]
    pub fn unmuted<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        self.unmuted = if names.iter().any(|n| n == "*") {
            Unmuted::All
        } else {
            Unmuted::Names(names)
        };
        self
    }

    /// Route change events for every property.
    #[must_use]
    pub fn unmuted_all(mut self) -> Self {
        self.unmuted = Unmuted::All;
        self
    }

    /// Write through (`true`) or around (`false`) the cache.
    #[must_use]
    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = Some(use_cache);
        self
    }

    fn is_muted(&self, name: &str) -> bool {
        match &self.unmuted {
            Unmuted::All => false,
            Unmuted::Names(names) => !names.iter().any(|n| n == name),
        }
    }
}

impl RuleFunction for SetSubjectProperties {
    fn name(&self) -> &str {
        "SetSubjectProperties"
    }

    fn execute(&self, ctx: &mut RuleContext<'_>) -> RuleResult {
        let props = object_arg("props", self.props.resolve_as(ctx, "props")?)?;
        for (name, value) in &props {
            ctx.subject.set_property(
                name,
                value.clone(),
                PropertyKind::Default,
                self.is_muted(name),
                self.use_cache,
            )?;
        }
        Ok(Value::Object(props))
    }
}

/// Deletes one subject property.
#[derive(Debug, Clone)]
pub struct DeleteSubjectProperty {
    property_name: String,
    kind: PropertyKind,
    muted: bool,
    use_cache: Option<bool>,
}

impl DeleteSubjectProperty {
    /// Delete the default property `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            property_name: name.into(),
            kind: PropertyKind::Default,
            muted: false,
            use_cache: None,
        }
    }

    /// Delete the extended property instead.
    #[must_use]
    pub fn extended(mut self) -> Self {
        self.kind = PropertyKind::Extended;
        self
    }

    /// Do not route `subject-property-deleted`.
    #[must_use]
    pub fn muted(mut self) -> Self {
        self.muted = true;
        self
    }

    /// Delete in the cache (`true`) or straight in storage (`false`).
    #[must_use]
    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = Some(use_cache);
        self
    }
}

impl RuleFunction for DeleteSubjectProperty {
    fn name(&self) -> &str {
        "DeleteSubjectProperty"
    }

    fn execute(&self, ctx: &mut RuleContext<'_>) -> RuleResult {
        ctx.record_arg("property_name", &self.property_name);
        ctx.subject
            .delete_property(&self.property_name, self.kind, self.muted, self.use_cache)?;
        Ok(Value::Bool(true))
    }
}

/// Writes the subject's cached changes to storage.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreSubject;

impl RuleFunction for StoreSubject {
    fn name(&self) -> &str {
        "StoreSubject"
    }

    fn execute(&self, ctx: &mut RuleContext<'_>) -> RuleResult {
        ctx.subject.store()?;
        Ok(Value::Null)
    }
}

/// Removes every property of the subject.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushSubject;

impl RuleFunction for FlushSubject {
    fn name(&self) -> &str {
        "FlushSubject"
    }

    fn execute(&self, ctx: &mut RuleContext<'_>) -> RuleResult {
        ctx.subject.flush()?;
        Ok(Value::Null)
    }
}

/// Routes a new event.
///
/// The event type, subject and payload default to those of the event being
/// handled. Returns the dispatcher's result, or `null` when the event was
/// not dispatched.
#[derive(Debug, Clone, Default)]
pub struct Route {
    event_type: Option<String>,
    subject: Option<Arg<String>>,
    payload: Option<Arg<Value>>,
    policy: DispatchPolicy,
}

impl Route {
    /// Route the current event to the current subject.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Event type to route instead of the current one.
    #[must_use]
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Route about another subject; its cached changes are stored afterwards.
    #[must_use]
    pub fn subject(mut self, subject: impl Into<Arg<String>>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Payload object to route.
    #[must_use]
    pub fn payload(mut self, payload: impl Into<Arg<Value>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Dispatch policy, `Default` unless set.
    #[must_use]
    pub fn policy(mut self, policy: DispatchPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl RuleFunction for Route {
    fn name(&self) -> &str {
        "Route"
    }

    fn execute(&self, ctx: &mut RuleContext<'_>) -> RuleResult {
        let event_type = self.event_type.clone().unwrap_or_else(|| ctx.event_type.to_string());
        ctx.record_arg("event_type", &event_type);
        let payload = match &self.payload {
            Some(arg) => object_arg("payload", arg.resolve_as(ctx, "payload")?)?,
            None => ctx.payload.clone(),
        };
        let subject = match &self.subject {
            Some(arg) => Some(arg.resolve_as(ctx, "subject")?),
            None => None,
        };
        ctx.record_arg("dispatch_policy", &self.policy);

        let router = ctx.router;
        let result = match subject {
            Some(name) if name != ctx.subject.name() => router.route_to(&event_type, &name, payload, self.policy)?,
            _ => router.route(&event_type, ctx.subject, payload, self.policy)?,
        };
        Ok(result.unwrap_or(Value::Null))
    }
}

/// Fails the rule on purpose.
///
/// By default the failure is a deliberate abort; [`RaiseError::failure`]
/// reports it as an unexpected error of the given class instead.
#[derive(Debug, Clone)]
pub struct RaiseError {
    message: Arg<String>,
    kind: Option<String>,
}

impl RaiseError {
    /// Abort the rule with `message`.
    pub fn new(message: impl Into<Arg<String>>) -> Self {
        Self {
            message: message.into(),
            kind: None,
        }
    }

    /// Report as an unexpected failure of class `kind`.
    #[must_use]
    pub fn failure(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

impl RuleFunction for RaiseError {
    fn name(&self) -> &str {
        "RaiseError"
    }

    fn execute(&self, ctx: &mut RuleContext<'_>) -> RuleResult {
        let message = self.message.resolve_as(ctx, "message")?;
        Err(match &self.kind {
            Some(kind) => RuleError::failed(kind.clone(), message),
            None => RuleError::abort(message),
        })
    }
}
