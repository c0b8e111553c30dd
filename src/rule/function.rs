use std::fmt;

use crate::error::RuleResult;
use crate::rule::context::RuleContext;

/// A filter or processing step of a rule.
///
/// Filters pass when the returned value is truthy. Processing steps may
/// return anything; the value is only recorded in proc events.
pub trait RuleFunction: Send + Sync {
    /// Name reported in proc events and logs.
    fn name(&self) -> &str;

    /// Run against the live context.
    fn execute(&self, ctx: &mut RuleContext<'_>) -> RuleResult;
}

/// Rule function backed by a closure.
///
/// ```
/// use ruleflow::rule::Callable;
/// use serde_json::Value;
///
/// let mark = Callable::new("mark", |ctx| {
///     ctx.payload.insert("marked".into(), Value::Bool(true));
///     Ok(Value::Null)
/// });
/// # let _ = mark;
/// ```
pub struct Callable<F> {
    name: String,
    f: F,
}

impl<F> Callable<F>
where
    F: Fn(&mut RuleContext<'_>) -> RuleResult + Send + Sync,
{
    /// Wrap `f` under `name`.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> fmt::Debug for Callable<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable").field("name", &self.name).finish_non_exhaustive()
    }
}

impl<F> RuleFunction for Callable<F>
where
    F: Fn(&mut RuleContext<'_>) -> RuleResult + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, ctx: &mut RuleContext<'_>) -> RuleResult {
        (self.f)(ctx)
    }
}
