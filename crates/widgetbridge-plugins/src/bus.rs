use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, warn};
use widgetbridge_core::ValidationMode;

use crate::topics::{TopicRegistry, Validation};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusEvent {
    pub topic: String,
    pub payload: Value,
}

impl BusEvent {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self { topic: topic.into(), payload }
    }
}

pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&Value) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Publish/subscribe channel shared by the host and every plugin it loads.
pub trait EventBus: Send + Sync {
    fn emit(&self, event: BusEvent);
    fn on(&self, topic: &str, handler: Handler) -> Subscription;

    fn publish(&self, topic: &str, payload: Value) {
        self.emit(BusEvent::new(topic, payload));
    }
}

/// Capability releasing exactly one subscription.
///
/// Releasing is idempotent and never fails, including after the bus is gone.
/// Dropping a `Subscription` does not release it.
pub struct Subscription {
    topic: String,
    release: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self { topic: topic.into(), release: Mutex::new(Some(Box::new(release))) }
    }

    /// A subscription that was never registered, e.g. handed out by a torn
    /// down bus.
    pub fn inert(topic: impl Into<String>) -> Self {
        Self { topic: topic.into(), release: Mutex::new(None) }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.release.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    pub fn unsubscribe(&self) {
        let release = self.release.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(release) = release {
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("active", &self.is_active())
            .finish()
    }
}

struct Listener {
    id: u64,
    live: Arc<AtomicBool>,
    handler: Handler,
}

#[derive(Default)]
struct BusState {
    next_id: u64,
    listeners: HashMap<String, Vec<Listener>>,
    closed: bool,
}

impl BusState {
    fn remove(&mut self, topic: &str, id: u64) {
        if let Some(list) = self.listeners.get_mut(topic) {
            list.retain(|l| l.id != id);
            if list.is_empty() {
                self.listeners.remove(topic);
            }
        }
    }
}

/// In-process bus. Delivery is synchronous: `emit` returns after every
/// matching handler ran.
#[derive(Clone)]
pub struct LocalEventBus {
    inner: Arc<Mutex<BusState>>,
    registry: Arc<TopicRegistry>,
    mode: ValidationMode,
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::with_registry(TopicRegistry::builtin(), ValidationMode::default())
    }

    pub fn with_registry(registry: TopicRegistry, mode: ValidationMode) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusState::default())),
            registry: Arc::new(registry),
            mode,
        }
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.lock().listeners.get(topic).map_or(0, Vec::len)
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().listeners.values().map(Vec::len).sum()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Tears the bus down. Every subscription is dropped and later calls to
    /// `emit` and `on` do nothing.
    pub fn shutdown(&self) {
        let dropped = {
            let mut state = self.lock();
            state.closed = true;
            std::mem::take(&mut state.listeners)
        };
        for listener in dropped.values().flatten() {
            listener.live.store(false, Ordering::SeqCst);
        }
        debug!(subscriptions = dropped.values().map(Vec::len).sum::<usize>(), "event bus shut down");
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(&self, event: &BusEvent) -> bool {
        if self.mode == ValidationMode::Off {
            return true;
        }
        match self.registry.validate(&event.topic, &event.payload) {
            Validation::Valid => true,
            Validation::Unregistered => {
                debug!(topic = %event.topic, "unregistered topic, passing through");
                true
            }
            Validation::Invalid(reasons) => {
                let enforce = self.mode == ValidationMode::Enforce;
                warn!(
                    topic = %event.topic,
                    reasons = %reasons.join("; "),
                    dropped = enforce,
                    "payload violates topic schema"
                );
                !enforce
            }
        }
    }
}

impl EventBus for LocalEventBus {
    fn emit(&self, event: BusEvent) {
        if !self.admit(&event) {
            return;
        }

        let snapshot: Vec<(u64, Arc<AtomicBool>, Handler)> = {
            let state = self.lock();
            if state.closed {
                debug!(topic = %event.topic, "emit on closed bus ignored");
                return;
            }
            match state.listeners.get(&event.topic) {
                Some(list) => list
                    .iter()
                    .map(|l| (l.id, l.live.clone(), l.handler.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };

        debug!(topic = %event.topic, listeners = snapshot.len(), "emit");
        for (id, live, handler) in snapshot {
            if !live.load(Ordering::SeqCst) {
                continue;
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&event.payload)));
            if let Err(cause) = outcome {
                warn!(
                    topic = %event.topic,
                    subscription = id,
                    "handler panicked: {}",
                    panic_message(cause.as_ref())
                );
            }
        }
    }

    fn on(&self, topic: &str, handler: Handler) -> Subscription {
        let mut state = self.lock();
        if state.closed {
            debug!(%topic, "subscribe on closed bus ignored");
            return Subscription::inert(topic);
        }
        let id = state.next_id;
        state.next_id += 1;
        let live = Arc::new(AtomicBool::new(true));
        state
            .listeners
            .entry(topic.to_string())
            .or_default()
            .push(Listener { id, live: live.clone(), handler });

        let weak: Weak<Mutex<BusState>> = Arc::downgrade(&self.inner);
        let owned_topic = topic.to_string();
        Subscription::new(topic, move || {
            live.store(false, Ordering::SeqCst);
            if let Some(inner) = weak.upgrade() {
                inner
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&owned_topic, id);
            }
        })
    }
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Handler {
        let log = log.clone();
        handler(move |_| log.lock().unwrap().push(name.to_string()))
    }

    #[test]
    fn delivers_in_subscription_order() {
        let bus = LocalEventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on("plugin:custom", recorder(&log, "a"));
        bus.on("plugin:custom", recorder(&log, "b"));
        bus.on("plugin:other", recorder(&log, "x"));
        bus.on("plugin:custom", recorder(&log, "c"));

        bus.publish("plugin:custom", json!({ "n": 1 }));
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn exactly_once_per_emit_and_never_after_release() {
        let bus = LocalEventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let sub = bus.on("plugin:custom", handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish("plugin:custom", Value::Null);
        bus.publish("plugin:custom", Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        bus.publish("plugin:custom", Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(bus.listener_count("plugin:custom"), 0);
    }

    #[test]
    fn no_replay_for_late_subscribers() {
        let bus = LocalEventBus::new();
        bus.publish("plugin:custom", json!(1));
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on("plugin:custom", recorder(&log, "late"));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn self_release_during_delivery_keeps_siblings() {
        let bus = LocalEventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on("plugin:custom", recorder(&log, "a"));

        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let inner_slot = slot.clone();
        let inner_log = log.clone();
        let sub = bus.on("plugin:custom", handler(move |_| {
            inner_log.lock().unwrap().push("self".to_string());
            if let Some(sub) = inner_slot.lock().unwrap().as_ref() {
                sub.unsubscribe();
            }
        }));
        *slot.lock().unwrap() = Some(sub);
        bus.on("plugin:custom", recorder(&log, "c"));

        bus.publish("plugin:custom", Value::Null);
        bus.publish("plugin:custom", Value::Null);
        assert_eq!(*log.lock().unwrap(), vec!["a", "self", "c", "a", "c"]);
    }

    #[test]
    fn sibling_released_mid_emit_is_not_invoked() {
        let bus = LocalEventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let killer_victim = victim.clone();
        let killer_log = log.clone();
        bus.on("plugin:custom", handler(move |_| {
            killer_log.lock().unwrap().push("killer".to_string());
            if let Some(sub) = killer_victim.lock().unwrap().as_ref() {
                sub.unsubscribe();
            }
        }));
        *victim.lock().unwrap() = Some(bus.on("plugin:custom", recorder(&log, "victim")));
        bus.on("plugin:custom", recorder(&log, "tail"));

        bus.publish("plugin:custom", Value::Null);
        assert_eq!(*log.lock().unwrap(), vec!["killer", "tail"]);
    }

    #[test]
    fn panicking_handler_is_isolated() {
        let bus = LocalEventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on("plugin:custom", handler(|_| panic!("handler exploded")));
        bus.on("plugin:custom", recorder(&log, "after"));

        bus.publish("plugin:custom", Value::Null);
        bus.publish("plugin:custom", Value::Null);
        assert_eq!(*log.lock().unwrap(), vec!["after", "after"]);
        assert_eq!(bus.listener_count("plugin:custom"), 2);
    }

    #[test]
    fn handlers_may_emit_and_subscribe_reentrantly() {
        let bus = LocalEventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on("plugin:pong", recorder(&log, "pong"));

        let reentrant = bus.clone();
        let nested_log = log.clone();
        bus.on("plugin:ping", handler(move |_| {
            reentrant.publish("plugin:pong", Value::Null);
            reentrant.on("plugin:ping", recorder(&nested_log, "late"));
        }));

        bus.publish("plugin:ping", Value::Null);
        assert_eq!(*log.lock().unwrap(), vec!["pong"]);
        assert_eq!(bus.listener_count("plugin:ping"), 2);
    }

    #[test]
    fn shutdown_makes_everything_a_no_op() {
        let bus = LocalEventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sub = bus.on("plugin:custom", recorder(&log, "a"));
        bus.shutdown();

        bus.publish("plugin:custom", Value::Null);
        let late = bus.on("plugin:custom", recorder(&log, "b"));
        assert!(!late.is_active());
        late.unsubscribe();
        sub.unsubscribe();
        sub.unsubscribe();

        assert!(bus.is_closed());
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(bus.subscription_count(), 0);
    }

    #[test]
    fn release_after_bus_dropped_is_safe() {
        let sub = {
            let bus = LocalEventBus::new();
            bus.on("plugin:custom", handler(|_| {}))
        };
        sub.unsubscribe();
        sub.unsubscribe();
    }

    #[test]
    fn enforce_mode_drops_invalid_payloads_for_known_topics() {
        let bus = LocalEventBus::with_registry(TopicRegistry::builtin(), ValidationMode::Enforce);
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on(crate::topics::PLUGIN_CONFIG_UPDATED, recorder(&log, "ack"));
        bus.on("plugin:custom", recorder(&log, "custom"));

        bus.publish(crate::topics::PLUGIN_CONFIG_UPDATED, json!({ "success": "yes" }));
        bus.publish(crate::topics::PLUGIN_CONFIG_UPDATED, json!({ "widgetId": "W", "success": true }));
        bus.publish("plugin:custom", json!("anything"));
        assert_eq!(*log.lock().unwrap(), vec!["ack", "custom"]);
    }

    #[test]
    fn warn_mode_still_delivers() {
        let bus = LocalEventBus::with_registry(TopicRegistry::builtin(), ValidationMode::Warn);
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.on(crate::topics::HOST_NOTIFICATION, recorder(&log, "notice"));
        bus.publish(crate::topics::HOST_NOTIFICATION, json!({ "type": "info" }));
        assert_eq!(*log.lock().unwrap(), vec!["notice"]);
    }

    #[test]
    fn usable_as_trait_object() {
        let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let sub = bus.on("host:broadcast", recorder(&log, "b"));
        bus.emit(BusEvent::new("host:broadcast", json!({ "hello": "world" })));
        sub.unsubscribe();
        bus.emit(BusEvent::new("host:broadcast", json!({})));
        assert_eq!(*log.lock().unwrap(), vec!["b"]);
    }
}
