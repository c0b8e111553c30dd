//! Error types for ruleflow.
//!
//! All errors are strongly typed using thiserror. Storage errors live with the
//! storage contract in [`crate::storage`]; this module holds the errors of the
//! layers built on top of it.

use std::error::Error as StdError;

use serde_json::{json, Value};
use thiserror::Error;

use crate::storage::StorageError;

/// Errors raised by subject operations.
#[derive(Debug, Error)]
pub enum SubjectError {
    /// The property is not set on the subject.
    #[error("Property '{property}' not found on subject '{subject}'")]
    NotFound {
        /// Subject name.
        subject: String,
        /// Property name.
        property: String,
    },

    /// The backend failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Routing the resulting change event failed. The write itself was committed.
    #[error("Routing error: {0}")]
    Routing(#[source] Box<RouterError>),
}

impl From<RouterError> for SubjectError {
    fn from(err: RouterError) -> Self {
        Self::Routing(Box::new(err))
    }
}

impl SubjectError {
    /// Returns true if this is the missing-property signal.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors raised by the event router.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Nested routing exceeded the configured depth.
    #[error("Route depth limit {depth} exceeded while routing '{event_type}'")]
    RecursionLimit {
        /// Event being routed when the limit was hit.
        event_type: String,
        /// Configured limit.
        depth: usize,
    },

    /// The dispatcher failed.
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// A backend could not be resolved or failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A subject operation failed.
    #[error("Subject error: {0}")]
    Subject(#[from] SubjectError),
}

/// Errors raised by a [`Dispatcher`](crate::router::Dispatcher).
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The transport failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote end refused the event.
    #[error("Rejected (status {status}): {message}")]
    Rejected {
        /// Status reported by the remote end.
        status: u16,
        /// Reason.
        message: String,
    },

    /// The outbound channel is closed.
    #[error("Dispatcher closed")]
    Closed,
}

/// Errors returned by rule functions.
///
/// `Abort` is a deliberate stop; every other variant is an unexpected failure.
/// Both are caught at the rule boundary.
#[derive(Debug, Error)]
pub enum RuleError {
    /// Deliberate abort of the rule.
    #[error("Rule aborted: {reason}")]
    Abort {
        /// Why the rule stopped.
        reason: String,
    },

    /// Unexpected failure with a caller-chosen class name.
    #[error("{kind}: {message}")]
    Failed {
        /// Error class reported in proc events.
        kind: String,
        /// Message.
        message: String,
        /// Structured details reported in proc events.
        extra: Option<Value>,
    },

    /// An argument could not be resolved.
    #[error("Invalid argument '{name}': {message}")]
    InvalidArgument {
        /// Argument name.
        name: String,
        /// Why it is invalid.
        message: String,
    },

    /// Subject operation failed.
    #[error("Subject error: {0}")]
    Subject(#[from] SubjectError),

    /// Routing from inside the rule failed.
    #[error("Router error: {0}")]
    Router(#[from] RouterError),

    /// JSON conversion failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result of a rule function.
pub type RuleResult = Result<Value, RuleError>;

fn storage_kind(err: &StorageError) -> &'static str {
    match err {
        StorageError::PropertyNotFound(_) => "PropertyNotFound",
        StorageError::DuplicateKey(_) => "DuplicateKey",
        StorageError::WriteConflict(_) => "WriteConflict",
        StorageError::UnknownCommitResult(_) => "UnknownCommitResult",
        StorageError::Http { .. } => "HttpError",
        StorageError::InvalidResourcePath(_) => "InvalidResourcePath",
        StorageError::InvalidValue(_) => "InvalidValue",
        StorageError::SerializationError(_) => "SerializationError",
        StorageError::BackendError(_) => "BackendError",
        StorageError::ConnectionError(_) => "ConnectionError",
    }
}

fn subject_kind(err: &SubjectError) -> &str {
    match err {
        SubjectError::NotFound { .. } => "PropertyNotFound",
        SubjectError::Storage(e) => storage_kind(e),
        SubjectError::Routing(e) => router_kind(e),
    }
}

fn router_kind(err: &RouterError) -> &str {
    match err {
        RouterError::RecursionLimit { .. } => "RecursionLimit",
        RouterError::Dispatch(_) => "DispatchError",
        RouterError::Storage(e) => storage_kind(e),
        RouterError::Subject(e) => subject_kind(e),
    }
}

impl RuleError {
    /// Deliberate abort.
    pub fn abort(reason: impl Into<String>) -> Self {
        Self::Abort {
            reason: reason.into(),
        }
    }

    /// Unexpected failure of class `kind`.
    pub fn failed(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            kind: kind.into(),
            message: message.into(),
            extra: None,
        }
    }

    /// Returns true for a deliberate abort.
    #[must_use]
    pub const fn is_abort(&self) -> bool {
        matches!(self, Self::Abort { .. })
    }

    /// Class name reported in proc events.
    #[must_use]
    pub fn exception_name(&self) -> &str {
        match self {
            Self::Abort { .. } => "RuleAbort",
            Self::Failed { kind, .. } => kind,
            Self::InvalidArgument { .. } => "InvalidArgument",
            Self::Subject(e) => subject_kind(e),
            Self::Router(e) => router_kind(e),
            Self::Serialization(_) => "SerializationError",
        }
    }

    /// This error followed by its source chain, one line each.
    #[must_use]
    pub fn trace(&self) -> Vec<String> {
        let mut out = vec![self.to_string()];
        let mut source = self.source();
        while let Some(err) = source {
            out.push(err.to_string());
            source = err.source();
        }
        out
    }

    /// Structured details: the HTTP status and body when a remote API
    /// answered, the explicit extra of a `Failed`, otherwise the message.
    #[must_use]
    pub fn extra_info(&self) -> Value {
        if let Self::Failed { extra: Some(extra), .. } = self {
            return extra.clone();
        }
        let mut source: Option<&(dyn StdError + 'static)> = self.source();
        while let Some(err) = source {
            if let Some(StorageError::Http { status, body }) = err.downcast_ref::<StorageError>() {
                return json!({
                    "response_code": status,
                    "response_text": body,
                });
            }
            source = err.source();
        }
        json!({ "args": [self.to_string()] })
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A setting has an unusable value.
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue {
        /// Setting name.
        key: String,
        /// Rejected value.
        value: String,
    },

    /// The configuration document is malformed.
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subject::property::PropertyKey;

    #[test]
    fn abort_is_distinguished() {
        let err = RuleError::abort("not today");
        assert!(err.is_abort());
        assert_eq!(err.exception_name(), "RuleAbort");
        assert!(!RuleError::failed("ValueError", "x").is_abort());
    }

    #[test]
    fn exception_name_reaches_storage_kind() {
        let err: RuleError = SubjectError::from(StorageError::WriteConflict("x".into())).into();
        assert_eq!(err.exception_name(), "WriteConflict");

        let err: RuleError = RouterError::RecursionLimit {
            event_type: "e".into(),
            depth: 3,
        }
        .into();
        assert_eq!(err.exception_name(), "RecursionLimit");
    }

    #[test]
    fn trace_walks_source_chain() {
        let err: RuleError = SubjectError::from(StorageError::PropertyNotFound(PropertyKey::default_ns("temp"))).into();
        let trace = err.trace();
        assert_eq!(trace.len(), 3);
        assert!(trace[2].contains("temp"));
    }

    #[test]
    fn extra_info_reports_http_response() {
        let err: RuleError = SubjectError::from(StorageError::Http {
            status: 422,
            body: "unprocessable".into(),
        })
        .into();
        assert_eq!(
            err.extra_info(),
            json!({"response_code": 422, "response_text": "unprocessable"})
        );
    }

    #[test]
    fn extra_info_defaults_to_message() {
        let err = RuleError::failed("ValueError", "bad input");
        assert_eq!(err.extra_info(), json!({"args": ["ValueError: bad input"]}));

        let err = RuleError::Failed {
            kind: "Custom".into(),
            message: "m".into(),
            extra: Some(json!({"code": 7})),
        };
        assert_eq!(err.extra_info(), json!({"code": 7}));
    }

    #[test]
    fn routing_failure_boxes_router_error() {
        let err: SubjectError = RouterError::Dispatch(DispatchError::Closed).into();
        assert!(matches!(err, SubjectError::Routing(_)));
        assert!(err.to_string().contains("Dispatcher closed"));
    }
}
