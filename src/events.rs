//! Per-component event subscriptions.
//!
//! Each component owns an [`EventPublisher`] and exposes `subscribe`. A
//! subscriber gets a [`Subscription`] with an unbounded receiver; publishing
//! never blocks, and subscribers whose receiver was dropped are pruned on the
//! next publish.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use uuid::Uuid;

/// An event that can be filtered by kind.
pub trait Event: Clone + Send + 'static {
    /// Discriminant used for subscription filters.
    type Kind: Copy + PartialEq + Send + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Handle returned by `subscribe`.
pub struct Subscription<E> {
    id: Uuid,
    receiver: Receiver<E>,
}

impl<E> Subscription<E> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn receiver(&self) -> &Receiver<E> {
        &self.receiver
    }

    /// Next event if one is queued.
    pub fn try_next(&self) -> Option<E> {
        self.receiver.try_recv().ok()
    }

    /// Drain every queued event.
    pub fn drain(&self) -> Vec<E> {
        self.receiver.try_iter().collect()
    }
}

impl<E> std::fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("queued", &self.receiver.len())
            .finish()
    }
}

struct Subscriber<E: Event> {
    id: Uuid,
    filter: Option<E::Kind>,
    sender: Sender<E>,
}

/// Publish list owned by a single component.
pub struct EventPublisher<E: Event> {
    subscribers: Mutex<Vec<Subscriber<E>>>,
}

impl<E: Event> EventPublisher<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to one kind of event, or to everything with `None`.
    pub fn subscribe(&self, kind: Option<E::Kind>) -> Subscription<E> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let id = Uuid::new_v4();
        self.subscribers.lock().push(Subscriber {
            id,
            filter: kind,
            sender,
        });
        Subscription { id, receiver }
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Deliver `event` to every matching subscriber.
    pub fn publish(&self, event: E) {
        let kind = event.kind();
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| {
            if s.filter.is_some_and(|f| f != kind) {
                return true;
            }
            s.sender.send(event.clone()).is_ok()
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl<E: Event> Default for EventPublisher<E> {
    fn default() -> Self {
        Self::new()
    }
}
