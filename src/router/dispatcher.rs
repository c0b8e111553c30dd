//! Outbound hand-off of events no local rule consumed.

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::subject::Subject;
use crate::value::{Payload, PropertyMap};

/// Sends events to an external transport.
///
/// The returned value (an event id or a response) is handed back to the
/// caller of `route`. Errors propagate to that caller; local state already
/// written stays written.
pub trait Dispatcher: Send + Sync {
    /// Hand one event off. `extra` carries transport extensions such as the
    /// property name of a property event.
    fn dispatch(
        &self,
        event_type: &str,
        subject: &Subject,
        payload: &Payload,
        extra: &Payload,
    ) -> Result<Value, DispatchError>;
}

impl<F> Dispatcher for F
where
    F: Fn(&str, &Subject, &Payload, &Payload) -> Result<Value, DispatchError> + Send + Sync,
{
    fn dispatch(
        &self,
        event_type: &str,
        subject: &Subject,
        payload: &Payload,
        extra: &Payload,
    ) -> Result<Value, DispatchError> {
        self(event_type, subject, payload, extra)
    }
}

/// Dispatcher that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDispatcher;

impl Dispatcher for NoopDispatcher {
    fn dispatch(
        &self,
        event_type: &str,
        subject: &Subject,
        _payload: &Payload,
        _extra: &Payload,
    ) -> Result<Value, DispatchError> {
        debug!(event_type, subject = subject.name(), "no dispatcher configured, event dropped");
        Ok(Value::Null)
    }
}

/// An event as handed to the transport, shaped after a `CloudEvent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent {
    /// Unique event id.
    pub id: Uuid,
    /// Producer identity.
    pub source: String,
    /// Event type.
    pub event_type: String,
    /// Subject name.
    pub subject: String,
    /// Creation time.
    pub time: DateTime<Utc>,
    /// Extended properties of the subject, for transport-side routing.
    pub ext_props: PropertyMap,
    /// Event payload.
    pub payload: Payload,
    /// Transport extensions.
    pub extra: Payload,
}

/// Dispatcher writing [`OutboundEvent`]s to a bounded channel.
///
/// Returns the generated event id as a string. A full channel fails the
/// dispatch instead of blocking the router.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    source: String,
    tx: Sender<OutboundEvent>,
}

impl ChannelDispatcher {
    /// Dispatcher plus the receiving end of its channel.
    #[must_use]
    pub fn new(source: impl Into<String>, capacity: usize) -> (Self, Receiver<OutboundEvent>) {
        let (tx, rx) = bounded(capacity.max(1));
        (
            Self {
                source: source.into(),
                tx,
            },
            rx,
        )
    }
}

impl Dispatcher for ChannelDispatcher {
    fn dispatch(
        &self,
        event_type: &str,
        subject: &Subject,
        payload: &Payload,
        extra: &Payload,
    ) -> Result<Value, DispatchError> {
        let ext_props = subject
            .get_ext_props()
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        let event = OutboundEvent {
            id: Uuid::new_v4(),
            source: self.source.clone(),
            event_type: event_type.to_string(),
            subject: subject.name().to_string(),
            time: Utc::now(),
            ext_props,
            payload: payload.clone(),
            extra: extra.clone(),
        };
        let id = event.id;
        match self.tx.try_send(event) {
            Ok(()) => Ok(Value::String(id.to_string())),
            Err(TrySendError::Full(_)) => Err(DispatchError::Transport("outbound queue full".to_string())),
            Err(TrySendError::Disconnected(_)) => Err(DispatchError::Closed),
        }
    }
}
