use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::events::{BusEvent, Topic};

pub type BusHandler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// In-process publish/subscribe hub.
///
/// Delivery is synchronous: `publish` returns after every handler subscribed to the topic
/// has run, in subscription order. Handlers may publish or (un)subscribe re-entrantly.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    topics: Mutex<HashMap<Topic, Vec<(u64, BusHandler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .topics
            .lock()
            .entry(topic)
            .or_default()
            .push((id, Arc::new(handler)));

        Subscription {
            topic,
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub fn publish(&self, topic: Topic, event: BusEvent) {
        // Snapshot so handlers run without the lock held
        let handlers: Vec<BusHandler> = match self.inner.topics.lock().get(&topic) {
            Some(subscribers) => subscribers.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return,
        };

        for handler in handlers {
            handler(&event);
        }
    }

    /// Publish on the event's own topic.
    pub fn emit(&self, event: BusEvent) {
        self.publish(event.topic(), event);
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner.topics.lock().get(&topic).map_or(0, Vec::len)
    }
}

/// Handle returned by [`EventBus::subscribe`]. Dropping it keeps the subscription alive.
#[derive(Debug)]
pub struct Subscription {
    topic: Topic,
    id: u64,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Remove the handler. Returns whether it was still subscribed; safe to call repeatedly.
    pub fn unsubscribe(&self) -> bool {
        let Some(bus) = self.bus.upgrade() else {
            return false;
        };
        let mut topics = bus.topics.lock();
        let Some(subscribers) = topics.get_mut(&self.topic) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|(id, _)| *id != self.id);
        before != subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MetricPoint;
    use pretty_assertions::assert_eq;

    fn metric(name: &str) -> BusEvent {
        BusEvent::Metric(MetricPoint::counter(name))
    }

    #[test]
    fn test_delivery_follows_subscription_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let seen = seen.clone();
            bus.subscribe(Topic::MetricPoint, move |_| seen.lock().push(label));
        }
        bus.publish(Topic::MetricPoint, metric("m"));

        assert_eq!(*seen.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_topics_are_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(0));
        let counter = seen.clone();
        bus.subscribe(Topic::Error, move |_| *counter.lock() += 1);

        bus.emit(metric("m"));
        assert_eq!(*seen.lock(), 0);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(0));
        let counter = seen.clone();
        let subscription = bus.subscribe(Topic::MetricPoint, move |_| *counter.lock() += 1);

        bus.emit(metric("a"));
        assert!(subscription.unsubscribe());
        assert!(!subscription.unsubscribe());
        bus.emit(metric("b"));

        assert_eq!(*seen.lock(), 1);
        assert_eq!(bus.subscriber_count(Topic::MetricPoint), 0);
    }

    #[test]
    fn test_handler_can_publish_reentrantly() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let inner_bus = bus.clone();
        bus.subscribe(Topic::Error, move |_| inner_bus.emit(metric("errors")));
        let sink = seen.clone();
        bus.subscribe(Topic::MetricPoint, move |event| {
            if let BusEvent::Metric(point) = event {
                sink.lock().push(point.name.clone());
            }
        });

        bus.emit(BusEvent::Error(crate::events::ErrorReport::new(
            crate::events::ErrorKind::Network,
            "test",
            "boom",
        )));

        assert_eq!(*seen.lock(), vec!["errors".to_string()]);
    }
}
