//! Event dispatcher
//!
//! Publish/subscribe registry that lets host applications observe sync
//! events without touching the transport. Each event kind carries a typed
//! payload (`SyncEvent`), so a subscriber to `StateChange` always receives a
//! `Point` and a subscriber to `ConnectionState` always receives a
//! `ConnectionState`.
//!
//! ## Usage
//!
//! ```ignore
//! let dispatcher = EventDispatcher::new();
//! let sub = dispatcher.on(EventKind::Message, |event| {
//!     println!("{:?}", event);
//!     Ok(())
//! });
//! dispatcher.publish(&SyncEvent::Message("hi".into()));
//! sub.unsubscribe();
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;
use tracing::warn;

use crate::models::Point;

/// Callback invoked for published events
pub type Listener = Arc<dyn Fn(&SyncEvent) -> anyhow::Result<()> + Send + Sync>;

/// Event names observers can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Free text from the hub
    Message,
    /// A single point was created or updated
    StateChange,
    /// Full initial state arrived
    Initialize,
    /// Connection state transition
    ConnectionState,
    /// A point left the store (explicit removal or TTL)
    Removed,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Message,
        EventKind::StateChange,
        EventKind::Initialize,
        EventKind::ConnectionState,
        EventKind::Removed,
    ];

    /// Stable external name
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::StateChange => "state-change",
            EventKind::Initialize => "initialize",
            EventKind::ConnectionState => "connection-state",
            EventKind::Removed => "removed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error details attached to a connection state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorInfo {
    pub message: String,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Payload of a `connection-state` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub connected: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub reconnecting: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ConnectionState {
    /// Link is up
    pub fn connected(connection_id: Option<String>) -> Self {
        Self {
            connected: true,
            reconnecting: false,
            connection_id,
            error: None,
        }
    }

    /// Link was lost and the transport is trying again
    pub fn reconnecting(error: Option<ErrorInfo>) -> Self {
        Self {
            connected: false,
            reconnecting: true,
            connection_id: None,
            error,
        }
    }

    /// Link is down for good
    pub fn closed(error: Option<ErrorInfo>) -> Self {
        Self {
            connected: false,
            reconnecting: false,
            connection_id: None,
            error,
        }
    }
}

/// Events published to observers
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Message(String),
    StateChange(Point),
    Initialize(Vec<Point>),
    ConnectionState(ConnectionState),
    Removed(String),
}

impl SyncEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SyncEvent::Message(_) => EventKind::Message,
            SyncEvent::StateChange(_) => EventKind::StateChange,
            SyncEvent::Initialize(_) => EventKind::Initialize,
            SyncEvent::ConnectionState(_) => EventKind::ConnectionState,
            SyncEvent::Removed(_) => EventKind::Removed,
        }
    }
}

struct Registration {
    id: u64,
    listener: Listener,
    /// Shared with every `Subscription` handed out for this registration
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: HashMap<EventKind, Vec<Registration>>,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    // Listeners never run under the lock, so a poisoned registry is still consistent
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn same_listener(a: &Listener, b: &Listener) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Publish/subscribe registry
///
/// Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    registry: Arc<Mutex<Registry>>,
    failures: Arc<AtomicU64>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` under `kind`
    ///
    /// Subscribing the same listener (same `Arc`) twice under one kind keeps a
    /// single registration. Every handle returned for it refers to that one
    /// registration, so unsubscribing through any of them deactivates all.
    pub fn subscribe(&self, kind: EventKind, listener: Listener) -> Subscription {
        let mut registry = lock(&self.registry);

        let existing = registry
            .listeners
            .get(&kind)
            .and_then(|regs| regs.iter().find(|r| same_listener(&r.listener, &listener)))
            .map(|r| (r.id, Arc::clone(&r.active)));

        let (id, active) = match existing {
            Some(found) => found,
            None => {
                registry.next_id += 1;
                let id = registry.next_id;
                let active = Arc::new(AtomicBool::new(true));
                registry
                    .listeners
                    .entry(kind)
                    .or_default()
                    .push(Registration {
                        id,
                        listener,
                        active: Arc::clone(&active),
                    });
                (id, active)
            }
        };

        Subscription {
            kind,
            id,
            registry: Arc::downgrade(&self.registry),
            active,
        }
    }

    /// Register a closure under `kind`
    pub fn on<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&SyncEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(kind, Arc::new(callback))
    }

    /// Invoke every listener registered for `event.kind()`
    ///
    /// A failing listener does not keep the others from running. Returns the
    /// number of listeners invoked.
    pub fn publish(&self, event: &SyncEvent) -> usize {
        let kind = event.kind();
        let listeners: Vec<Listener> = {
            let registry = lock(&self.registry);
            registry
                .listeners
                .get(&kind)
                .map(|regs| regs.iter().map(|r| Arc::clone(&r.listener)).collect())
                .unwrap_or_default()
        };

        for listener in &listeners {
            if let Err(e) = listener(event) {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!("Listener for '{}' failed: {:#}", kind, e);
            }
        }

        listeners.len()
    }

    /// Number of listeners currently registered under `kind`
    pub fn listener_count(&self, kind: EventKind) -> usize {
        lock(&self.registry)
            .listeners
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Listener invocations that returned an error so far
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for kind in EventKind::ALL {
            map.entry(&kind.name(), &self.listener_count(kind));
        }
        map.finish()
    }
}

/// Handle returned by `subscribe`; removes exactly its registration
pub struct Subscription {
    kind: EventKind,
    id: u64,
    registry: Weak<Mutex<Registry>>,
    active: Arc<AtomicBool>,
}

impl Subscription {
    /// Remove the registration
    ///
    /// Returns true on the call that actually removed it; later calls, through
    /// this handle or another one for the same registration, are no-ops.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }

        let Some(registry) = self.registry.upgrade() else {
            return false;
        };

        let mut registry = lock(&registry);
        let Some(regs) = registry.listeners.get_mut(&self.kind) else {
            return false;
        };

        let before = regs.len();
        regs.retain(|r| r.id != self.id);
        before != regs.len()
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Category;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, Listener) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let listener: Listener = Arc::new(move |_event: &SyncEvent| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (count, listener)
    }

    #[test]
    fn test_publish_invokes_once_per_publish() {
        let dispatcher = EventDispatcher::new();
        let (count, listener) = counter();
        let _sub = dispatcher.subscribe(EventKind::Message, listener);

        dispatcher.publish(&SyncEvent::Message("one".to_string()));
        dispatcher.publish(&SyncEvent::Message("two".to_string()));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let dispatcher = EventDispatcher::new();
        let (count, listener) = counter();
        let sub = dispatcher.subscribe(EventKind::Message, listener);

        dispatcher.publish(&SyncEvent::Message("before".to_string()));
        assert!(sub.unsubscribe());
        dispatcher.publish(&SyncEvent::Message("after".to_string()));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.listener_count(EventKind::Message), 0);
    }

    #[test]
    fn test_unsubscribe_twice_is_noop() {
        let dispatcher = EventDispatcher::new();
        let (_count, listener) = counter();
        let (_other_count, other) = counter();
        let sub = dispatcher.subscribe(EventKind::Message, listener);
        let _keep = dispatcher.subscribe(EventKind::Message, other);

        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        assert!(!sub.is_active());
        // The other registration is untouched
        assert_eq!(dispatcher.listener_count(EventKind::Message), 1);
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let dispatcher = EventDispatcher::new();
        let (count, listener) = counter();

        let _a = dispatcher.subscribe(EventKind::Message, Arc::clone(&listener));
        let _b = dispatcher.subscribe(EventKind::Message, Arc::clone(&listener));
        assert_eq!(dispatcher.listener_count(EventKind::Message), 1);

        dispatcher.publish(&SyncEvent::Message("x".to_string()));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Same listener under another kind is a separate registration
        let _c = dispatcher.subscribe(EventKind::Removed, listener);
        assert_eq!(dispatcher.listener_count(EventKind::Removed), 1);
    }

    #[test]
    fn test_duplicate_handles_share_registration() {
        let dispatcher = EventDispatcher::new();
        let (count, listener) = counter();

        let a = dispatcher.subscribe(EventKind::Message, Arc::clone(&listener));
        let b = dispatcher.subscribe(EventKind::Message, listener);

        assert!(a.unsubscribe());
        assert!(!a.is_active());
        assert!(!b.is_active());
        assert!(!b.unsubscribe());

        dispatcher.publish(&SyncEvent::Message("x".to_string()));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.listener_count(EventKind::Message), 0);
    }

    #[test]
    fn test_two_subscribers_receive_same_payload() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = Arc::clone(&seen);
        let _a = dispatcher.on(EventKind::StateChange, move |event| {
            s1.lock().unwrap().push(("a", event.clone()));
            Ok(())
        });
        let s2 = Arc::clone(&seen);
        let _b = dispatcher.on(EventKind::StateChange, move |event| {
            s2.lock().unwrap().push(("b", event.clone()));
            Ok(())
        });

        let event = SyncEvent::StateChange(Point::new("p", 1.0, 2.0, Category::Green));
        assert_eq!(dispatcher.publish(&event), 2);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|(_, e)| *e == event));
    }

    #[test]
    fn test_failing_listener_is_isolated() {
        let dispatcher = EventDispatcher::new();
        let (count, listener) = counter();

        let _bad = dispatcher.on(EventKind::Message, |_| anyhow::bail!("boom"));
        let _good = dispatcher.subscribe(EventKind::Message, listener);

        assert_eq!(dispatcher.publish(&SyncEvent::Message("x".to_string())), 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.failure_count(), 1);
    }

    #[test]
    fn test_publish_only_reaches_matching_kind() {
        let dispatcher = EventDispatcher::new();
        let (count, listener) = counter();
        let _sub = dispatcher.subscribe(EventKind::Initialize, listener);

        assert_eq!(dispatcher.publish(&SyncEvent::Message("x".to_string())), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listener_may_unsubscribe_itself() {
        let dispatcher = EventDispatcher::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicUsize::new(0));

        let s = Arc::clone(&slot);
        let c = Arc::clone(&count);
        let sub = dispatcher.on(EventKind::Message, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            if let Some(sub) = s.lock().unwrap().as_ref() {
                sub.unsubscribe();
            }
            Ok(())
        });
        *slot.lock().unwrap() = Some(sub);

        dispatcher.publish(&SyncEvent::Message("1".to_string()));
        dispatcher.publish(&SyncEvent::Message("2".to_string()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_connection_state_serialization() {
        let state = ConnectionState::connected(Some("abc".to_string()));
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json, serde_json::json!({"connected": true, "connectionId": "abc"}));

        let state = ConnectionState::reconnecting(Some(ErrorInfo::new("lost")));
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["reconnecting"], true);
        assert_eq!(json["error"]["message"], "lost");
    }
}
