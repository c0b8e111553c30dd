//! # ruleflow - Reactive rules over stateful subjects
//!
//! ruleflow routes events about *subjects* (named, stateful entities) to
//! registered *rules*. Rules filter events and process them, typically by
//! changing subject properties. A property change is itself an event
//! (`subject-property-changed`) and is routed synchronously through the same
//! router before the write returns. Events no rule handles go to a
//! [`Dispatcher`] for delivery elsewhere.
//!
//! ## Core Concepts
//!
//! - **Subject**: a name plus two property namespaces (reactive default
//!   properties and muted extended properties), with an optional write-back cache
//! - **Storage**: pluggable backends with an atomic per-property
//!   read-modify-write; memory, key/value, document and REST-resource
//!   reference implementations
//! - **Rule**: ordered filters and processing steps with explicit arguments
//! - **EventRouter**: rule registry plus the [`DispatchPolicy`] deciding
//!   whether an event leaves the process
//! - **ProcEvent**: optional diagnostic record of every rule execution
//!
//! ## Usage
//!
//! ```
//! use ruleflow::rule::filters::OnSubjectPropertyChanged;
//! use ruleflow::rule::processing::SetSubjectProperty;
//! use ruleflow::rule::{Arg, Rule};
//! use ruleflow::{DispatchPolicy, EventRouter, MemoryStore, Payload};
//! use serde_json::json;
//!
//! let store = MemoryStore::new();
//! let router = EventRouter::builder().resolver(store.clone()).build();
//!
//! // Derive `status` whenever `temp` changes.
//! router.register_rule(
//!     Rule::builder("temp-status")
//!         .filter(OnSubjectPropertyChanged::new("temp"))
//!         .processing(SetSubjectProperty::new(
//!             "status",
//!             Arg::with_payload(|p| json!(if p["value"].as_i64() > Some(30) { "hot" } else { "ok" })),
//!         ))
//!         .build(),
//!     &["subject-property-changed"],
//! );
//!
//! let mut sensor = router.subject("sensor|1").unwrap();
//! sensor.set("temp", 35).unwrap();
//! assert_eq!(sensor.get("status").unwrap(), json!("hot"));
//! sensor.store().unwrap();
//! # let _ = (DispatchPolicy::Default, Payload::new());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod proc_event;
pub mod router;
pub mod rule;
pub mod storage;
pub mod subject;
pub mod value;

// Re-export primary types at crate root for convenience
pub use config::{ProcEventsLevel, RouterConfig};
pub use error::{ConfigError, DispatchError, RouterError, RuleError, RuleResult, SubjectError};
pub use proc_event::{ProcEvent, ProcEventRouting, ProcEventStream};
pub use router::{ChannelDispatcher, DispatchPolicy, Dispatcher, EventRouter, NoopDispatcher, OutboundEvent};
pub use rule::{Arg, Callable, Rule, RuleContext, RuleFunction, RuleOutcome};
pub use storage::{MemoryStore, PrefixResolver, StorageError, StorageResolver, SubjectStorage};
pub use subject::property::{Property, PropertyKey, PropertyKind, PropertyValue};
pub use subject::Subject;
pub use value::Payload;
