//! Event routing.
//!
//! The [`EventRouter`] owns the rule registry. Routing an event runs every
//! rule registered for its type, plus the wildcard bucket, synchronously and
//! in registration order, then decides from the [`DispatchPolicy`] whether the
//! event also goes to the [`Dispatcher`].
//!
//! Rules may change subject properties, which routes change events back
//! through the same router before the write returns. Nesting is limited by
//! [`RouterConfig::max_route_depth`].

mod depth;
mod dispatcher;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::RouterConfig;
use crate::error::RouterError;
use crate::proc_event::{ProcEvent, ProcEventBus, ProcEventRouting, ProcEventStream, RULE_PROC_EVENT};
use crate::rule::Rule;
use crate::storage::{MemoryStore, StorageResolver};
use crate::subject::Subject;
use crate::value::Payload;

use depth::DepthGuard;
pub use dispatcher::{ChannelDispatcher, Dispatcher, NoopDispatcher, OutboundEvent};

/// Event type matching every event.
pub const WILDCARD: &str = "*";

/// Whether a routed event is handed to the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// Dispatch only when no rule is registered for the exact event type.
    /// Wildcard rules do not count.
    #[default]
    Default,
    /// Run local rules, then always dispatch.
    Always,
    /// Run local rules, never dispatch.
    Never,
    /// Skip local rules and dispatch.
    Direct,
}

impl DispatchPolicy {
    /// Whether local rules run.
    #[must_use]
    pub const fn runs_local(self) -> bool {
        !matches!(self, Self::Direct)
    }

    /// Whether the event is dispatched, given whether a rule is registered
    /// for its exact type.
    #[must_use]
    pub const fn dispatches(self, has_exact_handler: bool) -> bool {
        match self {
            Self::Default => !has_exact_handler,
            Self::Always | Self::Direct => true,
            Self::Never => false,
        }
    }
}

struct Registration {
    seq: u64,
    rule: Arc<Rule>,
}

#[derive(Default)]
struct Registry {
    buckets: HashMap<String, Vec<Registration>>,
    next_seq: u64,
}

impl Registry {
    fn handlers(&self, event_type: &str) -> (bool, Vec<Arc<Rule>>) {
        let exact = self.buckets.get(event_type).map_or(&[][..], Vec::as_slice);
        let wildcard = if event_type == WILDCARD {
            &[][..]
        } else {
            self.buckets.get(WILDCARD).map_or(&[][..], Vec::as_slice)
        };
        let mut all: Vec<&Registration> = exact.iter().chain(wildcard).collect();
        all.sort_by_key(|r| r.seq);
        (!exact.is_empty(), all.into_iter().map(|r| Arc::clone(&r.rule)).collect())
    }
}

struct RouterInner {
    registry: RwLock<Registry>,
    dispatcher: Arc<dyn Dispatcher>,
    resolver: Arc<dyn StorageResolver>,
    proc_events: ProcEventBus,
    proc_event_routing: Option<ProcEventRouting>,
    config: RouterConfig,
}

/// Rule registry plus dispatch.
///
/// Cloning is cheap; clones share the registry. Subjects built by the router
/// keep a clone to route their property events.
#[derive(Clone)]
pub struct EventRouter {
    inner: Arc<RouterInner>,
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.inner.registry.read().unwrap_or_else(PoisonError::into_inner);
        let mut event_types: Vec<&String> = registry.buckets.keys().collect();
        event_types.sort();
        f.debug_struct("EventRouter")
            .field("config", &self.inner.config)
            .field("event_types", &event_types)
            .finish_non_exhaustive()
    }
}

/// Builder for [`EventRouter`].
#[derive(Default)]
pub struct EventRouterBuilder {
    config: RouterConfig,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    resolver: Option<Arc<dyn StorageResolver>>,
    proc_event_routing: Option<ProcEventRouting>,
}

impl EventRouterBuilder {
    /// Replace the router settings.
    #[must_use]
    pub fn config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    /// Where unhandled events go. Defaults to [`NoopDispatcher`].
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: impl Dispatcher + 'static) -> Self {
        self.dispatcher = Some(Arc::new(dispatcher));
        self
    }

    /// Backend selection for subjects built from names. Defaults to a
    /// private [`MemoryStore`].
    #[must_use]
    pub fn resolver(mut self, resolver: impl StorageResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Route selected proc events as `rule-proc-event`. Overrides
    /// [`RouterConfig::proc_events_matching`].
    #[must_use]
    pub fn route_proc_events(mut self, routing: ProcEventRouting) -> Self {
        self.proc_event_routing = Some(routing);
        self
    }

    /// Build the router; missing parts default to a no-op dispatcher and an in-memory resolver.
    ///
    /// A [`RouterConfig::proc_events_matching`] that does not parse is
    /// logged and ignored.
    #[must_use]
    pub fn build(self) -> EventRouter {
        let dispatcher: Arc<dyn Dispatcher> = match self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => Arc::new(NoopDispatcher),
        };
        let resolver: Arc<dyn StorageResolver> = match self.resolver {
            Some(resolver) => resolver,
            None => Arc::new(MemoryStore::new()),
        };
        let routing = self.proc_event_routing.or_else(|| {
            let expr = self.config.proc_events_matching.as_deref()?;
            ProcEventRouting::matching(expr)
                .map_err(|err| warn!(error = %err, "ignoring proc event matching"))
                .ok()
        });
        EventRouter::with_parts(self.config, dispatcher, resolver, routing)
    }
}

impl EventRouter {
    /// Router over explicit collaborators.
    #[must_use]
    pub fn new(
        config: RouterConfig,
        dispatcher: Arc<dyn Dispatcher>,
        resolver: Arc<dyn StorageResolver>,
    ) -> Self {
        Self::with_parts(config, dispatcher, resolver, None)
    }

    fn with_parts(
        config: RouterConfig,
        dispatcher: Arc<dyn Dispatcher>,
        resolver: Arc<dyn StorageResolver>,
        proc_event_routing: Option<ProcEventRouting>,
    ) -> Self {
        let proc_events = ProcEventBus::new(config.proc_events_capacity);
        Self {
            inner: Arc::new(RouterInner {
                registry: RwLock::new(Registry::default()),
                dispatcher,
                resolver,
                proc_events,
                proc_event_routing,
                config,
            }),
        }
    }

    /// Start building a router.
    #[must_use]
    pub fn builder() -> EventRouterBuilder {
        EventRouterBuilder::default()
    }

    /// Router settings.
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    /// Bus rules publish proc events to.
    #[must_use]
    pub fn proc_events(&self) -> &ProcEventBus {
        &self.inner.proc_events
    }

    /// Subscribe to proc events. Nothing is published unless
    /// [`RouterConfig::proc_events_level`] enables it.
    pub fn subscribe_proc_events(&self) -> ProcEventStream {
        self.inner.proc_events.subscribe()
    }

    /// Whether rules should build proc events: somebody subscribed or
    /// records are routed.
    #[must_use]
    pub fn wants_proc_events(&self) -> bool {
        self.inner.proc_event_routing.is_some() || self.inner.proc_events.is_active()
    }

    /// Route `event` when the configured [`ProcEventRouting`] selects it,
    /// then publish it to subscribers.
    ///
    /// Routing failures are logged; they never reach the rule.
    pub fn publish_proc_event(&self, event: ProcEvent) {
        if let Some(routing) = &self.inner.proc_event_routing {
            self.route_proc_event(routing, &event);
        }
        self.inner.proc_events.publish(event);
    }

    fn route_proc_event(&self, routing: &ProcEventRouting, event: &ProcEvent) {
        let record = match serde_json::to_value(event) {
            Ok(record) => record,
            Err(err) => {
                warn!(rule = %event.rule_name, error = %err, "cannot serialize proc event");
                return;
            }
        };
        if !routing.selects(event, &record) {
            return;
        }
        let Value::Object(payload) = record else {
            return;
        };
        let policy = routing.policy(event);
        let routed = self
            .subject_with(&event.rule_name, event.event_info.clone(), None)
            .and_then(|mut subject| {
                let routed = self.route(RULE_PROC_EVENT, &mut subject, payload, policy);
                subject.store()?;
                routed
            });
        if let Err(err) = routed {
            warn!(rule = %event.rule_name, error = %err, "proc event routing failed");
        }
    }

    /// Append `rule` to the handlers of `event_type` (`"*"` for every event).
    pub fn register(&self, rule: Arc<Rule>, event_type: &str) {
        debug!(rule = rule.name(), event_type, "register rule");
        let mut registry = self.inner.registry.write().unwrap_or_else(PoisonError::into_inner);
        let seq = registry.next_seq;
        registry.next_seq += 1;
        registry
            .buckets
            .entry(event_type.to_string())
            .or_default()
            .push(Registration { seq, rule });
    }

    /// Register one rule for several event types.
    pub fn register_rule(&self, rule: Rule, subscribe_to: &[&str]) -> Arc<Rule> {
        let rule = Arc::new(rule);
        for event_type in subscribe_to {
            self.register(Arc::clone(&rule), event_type);
        }
        rule
    }

    /// Drop every handler of `event_type`. Returns how many were removed.
    pub fn unregister(&self, event_type: &str) -> usize {
        let removed = self
            .inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .buckets
            .remove(event_type)
            .map_or(0, |rules| rules.len());
        debug!(event_type, removed, "unregister event type");
        removed
    }

    /// Drop every handler. Returns how many were removed.
    pub fn unregister_all(&self) -> usize {
        let mut registry = self.inner.registry.write().unwrap_or_else(PoisonError::into_inner);
        let removed = registry.buckets.values().map(Vec::len).sum();
        registry.buckets.clear();
        debug!(removed, "unregister all");
        removed
    }

    /// Whether a rule is registered for exactly `event_type`.
    #[must_use]
    pub fn has_handlers(&self, event_type: &str) -> bool {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .buckets
            .get(event_type)
            .is_some_and(|rules| !rules.is_empty())
    }

    /// Storage-backed subject routed through this router.
    pub fn subject(&self, name: &str) -> Result<Subject, RouterError> {
        self.subject_with(name, Payload::new(), None)
    }

    /// Subject for an inbound event: `event_info` holds the event's
    /// attributes and `event_data` its data, which the resolver may use.
    pub fn subject_with(
        &self,
        name: &str,
        event_info: Payload,
        event_data: Option<&Payload>,
    ) -> Result<Subject, RouterError> {
        let storage = self.inner.resolver.resolve(name, event_data)?;
        Ok(Subject::new(name, storage)
            .with_router(self.clone())
            .with_cache(self.inner.config.use_cache_default)
            .with_event_info(event_info))
    }

    /// Route an event about `subject`.
    ///
    /// Returns the dispatcher's result when the event was dispatched. Failing
    /// rules never make this fail; dispatcher errors and the nesting limit do.
    ///
    /// # Errors
    /// - `RecursionLimit`: if routing is nested deeper than configured
    /// - `Dispatch`: if the dispatcher failed
    pub fn route(
        &self,
        event_type: &str,
        subject: &mut Subject,
        payload: Payload,
        policy: DispatchPolicy,
    ) -> Result<Option<Value>, RouterError> {
        self.route_with_extra(event_type, subject, payload, policy, Payload::new())
    }

    /// [`EventRouter::route`] with transport extensions for the dispatcher.
    pub fn route_with_extra(
        &self,
        event_type: &str,
        subject: &mut Subject,
        payload: Payload,
        policy: DispatchPolicy,
        extra: Payload,
    ) -> Result<Option<Value>, RouterError> {
        let _depth = DepthGuard::enter(self.inner.config.max_route_depth, event_type)?;
        let mut payload = payload;

        let (has_exact, rules) = self
            .inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers(event_type);
        debug!(
            event_type,
            subject = subject.name(),
            ?policy,
            handlers = rules.len(),
            depth = DepthGuard::current(),
            "route event"
        );

        if policy.runs_local() {
            for rule in &rules {
                rule.process(event_type, subject, &mut payload, self);
            }
        }

        if !policy.dispatches(has_exact) {
            return Ok(None);
        }
        debug!(event_type, subject = subject.name(), ?policy, "dispatch event");
        let result = self
            .inner
            .dispatcher
            .dispatch(event_type, subject, &payload, &extra)?;
        Ok(Some(result))
    }

    /// Route an event about the subject called `name`, then store the
    /// subject's cached changes.
    ///
    /// Changes are stored even when dispatching fails.
    pub fn route_to(
        &self,
        event_type: &str,
        name: &str,
        payload: Payload,
        policy: DispatchPolicy,
    ) -> Result<Option<Value>, RouterError> {
        let mut subject = self.subject_with(name, Payload::new(), Some(&payload))?;
        let routed = self.route(event_type, &mut subject, payload, policy);
        subject.store()?;
        routed
    }
}
