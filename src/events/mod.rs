//! Process-wide publish/subscribe bus shared by the host and plugins
//!
//! Listeners run synchronously on the publishing task, in registration
//! order. Nothing is persisted and nothing is replayed to late subscribers.
//!
//! Subscriptions are never removed on a plugin's behalf when it is
//! unregistered. A plugin that subscribes in `register` must unsubscribe in
//! `unregister`, otherwise its listeners keep firing after the rest of the
//! plugin has been torn down.
//!
//! Use [`EventBus::global`] for the process-wide instance, or
//! [`EventBus::new`] for an isolated bus (tests, embedded hosts).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use serde::Serialize;

/// Event published by the host after a server is created
pub const SERVER_CREATE: &str = "serverCreate";

/// Event published by the plugin runtime after every activation pass
pub const PLUGINS_RELOADED: &str = "plugins:reloaded";

static GLOBAL: OnceLock<EventBus> = OnceLock::new();

/// A published event
#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    /// Event name
    pub name: String,
    /// Arbitrary JSON payload
    pub payload: serde_json::Value,
}

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&BusEvent) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    event: String,
    listener: Listener,
}

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// Cloneable handle to a publish/subscribe channel
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Create an isolated bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide bus
    #[must_use]
    pub fn global() -> &'static Self {
        GLOBAL.get_or_init(Self::new)
    }

    /// Register a listener for `event`
    pub fn subscribe<F>(&self, event: &str, listener: F) -> SubscriptionId
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions().push(Subscription {
            id,
            event: event.to_string(),
            listener: Arc::new(listener),
        });
        tracing::debug!(event = %event, id = id.0, "listener subscribed");
        id
    }

    /// Remove one listener, returning true if it was registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        before != subs.len()
    }

    /// Remove every listener for `event`, returning how many were removed
    pub fn remove_all_listeners(&self, event: &str) -> usize {
        let mut subs = self.subscriptions();
        let before = subs.len();
        subs.retain(|s| s.event != event);
        before - subs.len()
    }

    /// Number of listeners currently registered for `event`
    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.subscriptions()
            .iter()
            .filter(|s| s.event == event)
            .count()
    }

    /// Deliver an event to its listeners, returning how many were invoked
    ///
    /// The listener list is snapshotted first, so listeners may subscribe or
    /// unsubscribe while the event is being delivered.
    pub fn publish(&self, event: &str, payload: serde_json::Value) -> usize {
        let listeners: Vec<Listener> = self
            .subscriptions()
            .iter()
            .filter(|s| s.event == event)
            .map(|s| Arc::clone(&s.listener))
            .collect();

        let event = BusEvent {
            name: event.to_string(),
            payload,
        };
        for listener in &listeners {
            listener(&event);
        }
        listeners.len()
    }

    fn subscriptions(&self) -> std::sync::MutexGuard<'_, Vec<Subscription>> {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.subscriptions().len())
            .finish_non_exhaustive()
    }
}
