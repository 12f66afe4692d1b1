//! In-process event bus.
//!
//! Topics map to an ordered list of uniquely named handlers. `emit` calls
//! every handler registered for the event's topic, synchronously and in
//! registration order. Handlers must not block: anything async goes onto
//! a job queue. There is no buffering, so an event emitted before a
//! handler is registered never reaches it.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;

/// An event whose topic is determined by its variant.
pub trait BusEvent: Send + Sync + 'static {
    type Topic: Copy + Eq + Hash + Ord + Debug + Send + Sync + 'static;

    fn topic(&self) -> Self::Topic;
}

pub type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub struct EventBus<E: BusEvent> {
    handlers: DashMap<E::Topic, Vec<(String, Handler<E>)>>,
}

impl<E: BusEvent> EventBus<E> {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Register `handler` under `name`. Registering the same name twice on
    /// a topic replaces the earlier handler in place.
    pub fn register<F>(&self, topic: E::Topic, name: &str, handler: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let handler: Handler<E> = Arc::new(handler);
        let mut entry = self.handlers.entry(topic).or_default();
        if let Some(existing) = entry.iter_mut().find(|(n, _)| n == name) {
            log::warn!("Bus: replacing handler '{}' on {:?}", name, topic);
            existing.1 = handler;
        } else {
            log::debug!("Bus: registered '{}' on {:?}", name, topic);
            entry.push((name.to_string(), handler));
        }
    }

    /// Dispatch to the current handlers of the event's topic. Returns how
    /// many handlers ran.
    pub fn emit(&self, event: E) -> usize {
        let topic = event.topic();
        // Copy the handler list out so handlers may register or emit
        // without holding the map shard.
        let handlers: Vec<Handler<E>> = match self.handlers.get(&topic) {
            Some(entry) => entry.iter().map(|(_, h)| h.clone()).collect(),
            None => return 0,
        };
        for handler in &handlers {
            handler(&event);
        }
        handlers.len()
    }

    /// Handler names for a topic, in dispatch order.
    pub fn handlers(&self, topic: E::Topic) -> Vec<String> {
        self.handlers
            .get(&topic)
            .map(|entry| entry.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default()
    }

    /// Topics with at least one handler, sorted.
    pub fn registered_topics(&self) -> Vec<E::Topic> {
        let mut topics: Vec<E::Topic> = self
            .handlers
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| *entry.key())
            .collect();
        topics.sort();
        topics
    }

    /// Drop every handler.
    pub fn clear(&self) {
        self.handlers.clear();
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    enum TestTopic {
        Ping,
        Pong,
    }

    enum TestEvent {
        Ping(u32),
        Pong,
    }

    impl BusEvent for TestEvent {
        type Topic = TestTopic;

        fn topic(&self) -> TestTopic {
            match self {
                TestEvent::Ping(_) => TestTopic::Ping,
                TestEvent::Pong => TestTopic::Pong,
            }
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> impl Fn(&TestEvent) + Send + Sync {
        let log = log.clone();
        move |event| {
            if let TestEvent::Ping(n) = event {
                log.lock().push(format!("{}:{}", tag, n));
            }
        }
    }

    #[test]
    fn test_emit_in_registration_order() {
        let bus = EventBus::<TestEvent>::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.register(TestTopic::Ping, "first", recorder(&log, "first"));
        bus.register(TestTopic::Ping, "second", recorder(&log, "second"));

        assert_eq!(bus.emit(TestEvent::Ping(1)), 2);
        assert_eq!(*log.lock(), vec!["first:1", "second:1"]);
    }

    #[test]
    fn test_reregistration_replaces_in_place() {
        let bus = EventBus::<TestEvent>::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.register(TestTopic::Ping, "a", recorder(&log, "old"));
        bus.register(TestTopic::Ping, "b", recorder(&log, "b"));
        bus.register(TestTopic::Ping, "a", recorder(&log, "new"));

        assert_eq!(bus.handlers(TestTopic::Ping), vec!["a", "b"]);
        bus.emit(TestEvent::Ping(7));
        assert_eq!(*log.lock(), vec!["new:7", "b:7"]);
    }

    #[test]
    fn test_emit_without_subscribers_is_dropped() {
        let bus = EventBus::<TestEvent>::new();
        assert_eq!(bus.emit(TestEvent::Pong), 0);
        assert!(bus.registered_topics().is_empty());
    }

    #[test]
    fn test_late_subscriber_misses_earlier_events() {
        let bus = EventBus::<TestEvent>::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.emit(TestEvent::Ping(1));
        bus.register(TestTopic::Ping, "late", recorder(&log, "late"));
        bus.emit(TestEvent::Ping(2));
        assert_eq!(*log.lock(), vec!["late:2"]);
    }

    #[test]
    fn test_introspection_and_clear() {
        let bus = EventBus::<TestEvent>::new();
        bus.register(TestTopic::Pong, "p", |_| {});
        bus.register(TestTopic::Ping, "q", |_| {});
        assert_eq!(bus.registered_topics(), vec![TestTopic::Ping, TestTopic::Pong]);

        bus.clear();
        assert!(bus.registered_topics().is_empty());
        assert!(bus.handlers(TestTopic::Ping).is_empty());
    }

    #[test]
    fn test_handler_can_register_during_emit() {
        let bus = Arc::new(EventBus::<TestEvent>::new());
        let inner = bus.clone();
        bus.register(TestTopic::Ping, "registrar", move |_| {
            inner.register(TestTopic::Pong, "added", |_| {});
        });
        bus.emit(TestEvent::Ping(1));
        assert_eq!(bus.handlers(TestTopic::Pong), vec!["added"]);
        bus.clear();
    }
}
