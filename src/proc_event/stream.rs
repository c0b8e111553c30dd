use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use thiserror::Error;
use uuid::Uuid;

use super::ProcEvent;

/// Errors returned when reading a [`ProcEventStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvError {
    /// Nothing arrived in time.
    #[error("Timed out waiting for a proc event")]
    Timeout,
    /// The subscription was removed or the bus is gone.
    #[error("Proc event stream disconnected")]
    Disconnected,
}

/// Fan-out of proc events to subscribers.
///
/// Publishing never blocks: a subscriber whose buffer is full misses the event
/// and the drop is counted. Subscribers whose stream was dropped are pruned on
/// the next publish.
#[derive(Debug)]
pub struct ProcEventBus {
    capacity: usize,
    subscribers: Mutex<Vec<(Uuid, Sender<Arc<ProcEvent>>)>>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl ProcEventBus {
    /// Bus giving each subscriber a buffer of `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Add a subscriber.
    pub fn subscribe(&self) -> ProcEventStream {
        let (tx, rx) = bounded(self.capacity);
        let id = Uuid::new_v4();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, tx));
        ProcEventStream { id, rx }
    }

    /// Remove a subscriber. Its stream disconnects once drained.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = subs.len();
        subs.retain(|(sub, _)| *sub != id);
        subs.len() != before
    }

    /// Whether anyone listens. Rules skip building records when nobody does.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Deliver an event to every subscriber.
    pub fn publish(&self, event: ProcEvent) {
        let event = Arc::new(event);
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subs.retain(|(_, tx)| match tx.try_send(Arc::clone(&event)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    /// Events published so far.
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Deliveries skipped because a subscriber buffer was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Receiving end of a proc-event subscription.
#[derive(Debug)]
pub struct ProcEventStream {
    id: Uuid,
    rx: Receiver<Arc<ProcEvent>>,
}

impl ProcEventStream {
    /// Subscription id, for [`ProcEventBus::unsubscribe`].
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<Arc<ProcEvent>, RecvError> {
        self.rx.recv().map_err(|_| RecvError::Disconnected)
    }

    /// Receive the next event with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Arc<ProcEvent>, RecvError> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => RecvError::Timeout,
            RecvTimeoutError::Disconnected => RecvError::Disconnected,
        })
    }

    /// Receive an event if one is buffered.
    pub fn try_recv(&self) -> Result<Arc<ProcEvent>, RecvError> {
        self.rx.try_recv().map_err(|err| match err {
            TryRecvError::Empty => RecvError::Timeout,
            TryRecvError::Disconnected => RecvError::Disconnected,
        })
    }

    /// Drain everything buffered.
    pub fn try_iter(&self) -> impl Iterator<Item = Arc<ProcEvent>> + '_ {
        self.rx.try_iter()
    }
}
