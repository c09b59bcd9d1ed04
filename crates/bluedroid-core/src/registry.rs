//! Subscriber registry for fanning out events to live clients.
//!
//! Clients register an [`Endpoint`]; every [`SubscriberRegistry::publish`]
//! delivers to all of them. An endpoint whose delivery fails is treated as
//! dead and removed, without affecting the others in the same publish.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, info};

use bluedroid_types::Event;

use crate::error::DeliveryError;

/// Identifies one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "subscriber-{}", self.0)
    }
}

/// A client able to accept events.
///
/// `deliver` is called without any registry lock held and must not block
/// for long; an `Err` permanently deregisters the endpoint.
pub trait Endpoint: Send + Sync {
    fn deliver(&self, event: &Event) -> Result<(), DeliveryError>;
}

/// Endpoint backed by an unbounded channel.
///
/// Delivery fails once the receiver is dropped.
#[derive(Debug, Clone)]
pub struct ChannelEndpoint {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelEndpoint {
    pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }

    /// Create an endpoint and the receiver a client reads from.
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Endpoint for ChannelEndpoint {
    fn deliver(&self, event: &Event) -> Result<(), DeliveryError> {
        self.tx
            .send(event.clone())
            .map_err(|_| DeliveryError::Disconnected)
    }
}

type Entry = (SubscriberId, Arc<dyn Endpoint>);

/// The set of live subscribers.
///
/// Shared behind an `Arc` by every component that publishes. Publish order
/// from a single caller is preserved for every endpoint.
#[derive(Default)]
pub struct SubscriberRegistry {
    endpoints: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
        self.endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an endpoint.
    pub fn register(&self, endpoint: Arc<dyn Endpoint>) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries().push((id, endpoint));
        debug!("Registered {}", id);
        id
    }

    /// Register a channel endpoint and return its receiver.
    pub fn subscribe(&self) -> (SubscriberId, mpsc::UnboundedReceiver<Event>) {
        let (endpoint, rx) = ChannelEndpoint::pair();
        (self.register(Arc::new(endpoint)), rx)
    }

    /// Remove an endpoint. Returns `false` if it was not registered.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        before != entries.len()
    }

    /// Get the number of registered endpoints.
    pub fn subscriber_count(&self) -> usize {
        self.entries().len()
    }

    /// Deliver `event` to every endpoint, pruning those that fail.
    ///
    /// Delivery runs on a snapshot taken under the lock, so endpoints may
    /// register or unregister concurrently. Returns the number of endpoints
    /// that accepted the event.
    pub fn publish(&self, event: Event) -> usize {
        let snapshot: Vec<Entry> = self.entries().clone();

        let mut dead = Vec::new();
        for (id, endpoint) in &snapshot {
            if let Err(e) = endpoint.deliver(&event) {
                debug!("Delivery to {} failed: {}", id, e);
                dead.push(*id);
            }
        }

        if !dead.is_empty() {
            self.entries().retain(|(id, _)| !dead.contains(id));
            info!("Pruned {} dead subscriber(s)", dead.len());
        }

        snapshot.len() - dead.len()
    }

    /// Publish a [`Event::Status`].
    pub fn status(&self, text: impl Into<String>) -> usize {
        let text = text.into();
        info!("{}", text);
        self.publish(Event::Status(text))
    }
}
