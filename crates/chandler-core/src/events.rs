//! Valve event bus and ordered listener registries.
//!
//! Two delivery styles are offered. [`EventDispatcher`] is a broadcast
//! channel of serializable [`ValveEvent`]s for consumers that run in their
//! own task. [`ListenerRegistry`] holds synchronous callbacks that are
//! invoked in registration order; removing a listener is idempotent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;

use chandler_types::{AuthenticationState, DashboardSnapshot, PasswordState};

/// Events published by sessions.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ValveEvent {
    /// Identity learned from a DeviceList response.
    DeviceInfo {
        address: String,
        serial_number: Option<String>,
        firmware: Option<String>,
    },
    /// A complete Dashboard snapshot was decoded.
    Dashboard {
        address: String,
        snapshot: DashboardSnapshot,
    },
    /// Authentication status after a DeviceList exchange.
    Authentication {
        address: String,
        state: PasswordState,
        authentication_state: AuthenticationState,
    },
    /// The authentication lockout was latched or cleared.
    LockoutChanged { address: String, locked_out: bool },
    /// A poll attempt finished.
    PollCompleted {
        address: String,
        success: bool,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
}

impl ValveEvent {
    /// Address of the valve the event is about.
    #[must_use]
    pub fn address(&self) -> &str {
        match self {
            ValveEvent::DeviceInfo { address, .. }
            | ValveEvent::Dashboard { address, .. }
            | ValveEvent::Authentication { address, .. }
            | ValveEvent::LockoutChanged { address, .. }
            | ValveEvent::PollCompleted { address, .. } => address,
        }
    }
}

/// Sender for valve events.
pub type EventSender = broadcast::Sender<ValveEvent>;

/// Receiver for valve events.
pub type EventReceiver = broadcast::Receiver<ValveEvent>;

/// Broadcasts events to any number of receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: ValveEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Handle returned by [`ListenerRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered set of synchronous callbacks.
pub struct ListenerRegistry<T> {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Callback<T>)>>,
}

impl<T> ListenerRegistry<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a callback. It runs after every callback registered before it.
    pub fn add<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback. Returns whether it was still registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Invoke every callback with `value`.
    pub fn notify(&self, value: &T) {
        // Snapshot so callbacks may add or remove listeners.
        let callbacks: Vec<Callback<T>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(value);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for ListenerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for ListenerRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_listeners_run_in_registration_order() {
        let registry = ListenerRegistry::<u8>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let seen = Arc::clone(&seen);
            registry.add(move |v: &u8| seen.lock().unwrap().push(format!("{tag}{v}")));
        }
        registry.notify(&1);
        assert_eq!(*seen.lock().unwrap(), vec!["a1", "b1", "c1"]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = ListenerRegistry::<u8>::new();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        let id = registry.add(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let other = registry.add(|_| {});

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert_eq!(registry.len(), 1);

        registry.notify(&0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(registry.remove(other));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_listener_can_remove_itself() {
        let registry = Arc::new(ListenerRegistry::<u8>::new());
        let slot = Arc::new(Mutex::new(None));
        let (r, s) = (Arc::clone(&registry), Arc::clone(&slot));
        let id = registry.add(move |_| {
            if let Some(id) = *s.lock().unwrap() {
                r.remove(id);
            }
        });
        *slot.lock().unwrap() = Some(id);
        registry.notify(&0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_dispatcher_broadcasts() {
        let dispatcher = EventDispatcher::new(8);
        let mut rx1 = dispatcher.subscribe();
        let mut rx2 = dispatcher.subscribe();
        assert_eq!(dispatcher.receiver_count(), 2);

        dispatcher.send(ValveEvent::LockoutChanged {
            address: "AA".into(),
            locked_out: true,
        });

        for rx in [&mut rx1, &mut rx2] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.address(), "AA");
        }
    }

    #[test]
    fn test_send_without_receivers() {
        EventDispatcher::default().send(ValveEvent::LockoutChanged {
            address: "AA".into(),
            locked_out: false,
        });
    }

    #[test]
    fn test_event_serialization() {
        let event = ValveEvent::PollCompleted {
            address: "AA".into(),
            success: true,
            at: OffsetDateTime::UNIX_EPOCH,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "poll_completed");
        assert_eq!(json["at"], "1970-01-01T00:00:00Z");
    }
}
