//! Rule function arguments.
//!
//! An argument is either a constant or a function of the rule context,
//! resolved right before the rule function body runs. The variant states
//! what the function reads.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::RuleError;
use crate::rule::context::RuleContext;
use crate::subject::Subject;
use crate::value::Payload;

type LazyFn<T> = dyn Fn() -> T + Send + Sync;
type PayloadFn<T> = dyn Fn(&Payload) -> T + Send + Sync;
type SubjectFn<T> = dyn Fn(&mut Subject) -> Result<T, RuleError> + Send + Sync;
type ContextFn<T> = dyn Fn(&mut RuleContext<'_>) -> Result<T, RuleError> + Send + Sync;

/// A rule function argument.
///
/// ```
/// use ruleflow::rule::Arg;
/// use serde_json::{json, Value};
///
/// let fixed: Arg<Value> = json!(3).into();
/// let from_payload: Arg<Value> = Arg::with_payload(|p| p.get("n").cloned().unwrap_or(Value::Null));
/// # let _ = (fixed, from_payload);
/// ```
pub enum Arg<T> {
    /// Fixed value.
    Const(T),
    /// Computed without inputs.
    Lazy(Arc<LazyFn<T>>),
    /// Computed from the event payload.
    WithPayload(Arc<PayloadFn<T>>),
    /// Computed from the subject.
    WithSubject(Arc<SubjectFn<T>>),
    /// Computed from the whole context.
    WithContext(Arc<ContextFn<T>>),
}

impl<T: Clone> Arg<T> {
    /// Computed on each use.
    pub fn lazy<F>(f: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::Lazy(Arc::new(f))
    }

    /// Computed from the payload.
    pub fn with_payload<F>(f: F) -> Self
    where
        F: Fn(&Payload) -> T + Send + Sync + 'static,
    {
        Self::WithPayload(Arc::new(f))
    }

    /// Computed from the subject.
    pub fn with_subject<F>(f: F) -> Self
    where
        F: Fn(&mut Subject) -> Result<T, RuleError> + Send + Sync + 'static,
    {
        Self::WithSubject(Arc::new(f))
    }

    /// Computed from the whole context.
    pub fn with_context<F>(f: F) -> Self
    where
        F: Fn(&mut RuleContext<'_>) -> Result<T, RuleError> + Send + Sync + 'static,
    {
        Self::WithContext(Arc::new(f))
    }

    /// Resolve against the live context.
    pub fn resolve(&self, ctx: &mut RuleContext<'_>) -> Result<T, RuleError> {
        match self {
            Self::Const(v) => Ok(v.clone()),
            Self::Lazy(f) => Ok(f()),
            Self::WithPayload(f) => Ok(f(&*ctx.payload)),
            Self::WithSubject(f) => f(&mut *ctx.subject),
            Self::WithContext(f) => f(ctx),
        }
    }
}

impl<T: Clone + Serialize> Arg<T> {
    /// Resolve and record the value under `name` for proc events.
    pub fn resolve_as(&self, ctx: &mut RuleContext<'_>, name: &str) -> Result<T, RuleError> {
        let value = self.resolve(ctx)?;
        ctx.record_arg(name, &value);
        Ok(value)
    }
}

impl<T: Clone> Clone for Arg<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Const(v) => Self::Const(v.clone()),
            Self::Lazy(f) => Self::Lazy(Arc::clone(f)),
            Self::WithPayload(f) => Self::WithPayload(Arc::clone(f)),
            Self::WithSubject(f) => Self::WithSubject(Arc::clone(f)),
            Self::WithContext(f) => Self::WithContext(Arc::clone(f)),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Arg<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Const(v) => f.debug_tuple("Const").field(v).finish(),
            Self::Lazy(_) => f.write_str("Lazy(..)"),
            Self::WithPayload(_) => f.write_str("WithPayload(..)"),
            Self::WithSubject(_) => f.write_str("WithSubject(..)"),
            Self::WithContext(_) => f.write_str("WithContext(..)"),
        }
    }
}

impl<T> From<T> for Arg<T> {
    fn from(value: T) -> Self {
        Self::Const(value)
    }
}

impl From<&str> for Arg<String> {
    fn from(value: &str) -> Self {
        Self::Const(value.to_string())
    }
}

macro_rules! value_arg_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Arg<Value> {
                fn from(value: $ty) -> Self {
                    Self::Const(Value::from(value))
                }
            }
        )*
    };
}

value_arg_from!(bool, i32, i64, u32, u64, f64, &str, String, Map<String, Value>);
