//! Publish/subscribe capability consumed by the watchdog.
//!
//! The watchdog never talks to a transport directly. It is handed a [`Bus`]
//! at construction and registers prefix subscriptions on it. [`MemoryBus`] is
//! the in-process implementation; the HTTP ingress publishes onto it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A message delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishEvent {
    pub topic: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub message: Value,
}

impl PublishEvent {
    pub fn new(topic: impl Into<String>, message: Value) -> Self {
        Self {
            topic: topic.into(),
            headers: HashMap::new(),
            message,
        }
    }
}

/// Receives events for the prefixes it subscribed to.
pub trait Subscriber: Send + Sync {
    fn on_publish(&self, event: &PublishEvent);
}

/// Topic-prefix publish/subscribe.
///
/// `owner` identifies the subscribing component so it can drop its own
/// subscriptions without touching anyone else's.
pub trait Bus: Send + Sync {
    fn subscribe(&self, owner: &str, prefix: &str, subscriber: Arc<dyn Subscriber>);
    fn unsubscribe(&self, owner: &str, prefix: &str);
    /// Returns the number of subscribers the event was delivered to.
    fn publish(&self, event: &PublishEvent) -> usize;
}

struct Subscription {
    owner: String,
    prefix: String,
    subscriber: Arc<dyn Subscriber>,
}

/// In-process bus. Each owner receives an event at most once even if
/// several of its prefixes match.
#[derive(Default)]
pub struct MemoryBus {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().map(|s| s.len()).unwrap_or(0)
    }
}

impl Bus for MemoryBus {
    fn subscribe(&self, owner: &str, prefix: &str, subscriber: Arc<dyn Subscriber>) {
        let Ok(mut subs) = self.subscriptions.write() else {
            tracing::error!("Bus: subscription table poisoned, dropping subscribe for {}", prefix);
            return;
        };
        if subs.iter().any(|s| s.owner == owner && s.prefix == prefix) {
            return;
        }
        subs.push(Subscription {
            owner: owner.to_string(),
            prefix: prefix.to_string(),
            subscriber,
        });
    }

    fn unsubscribe(&self, owner: &str, prefix: &str) {
        if let Ok(mut subs) = self.subscriptions.write() {
            subs.retain(|s| !(s.owner == owner && s.prefix == prefix));
        }
    }

    fn publish(&self, event: &PublishEvent) -> usize {
        // Collect first so callbacks run without the table locked.
        let targets: Vec<Arc<dyn Subscriber>> = {
            let Ok(subs) = self.subscriptions.read() else {
                return 0;
            };
            let mut seen: Vec<&str> = Vec::new();
            let mut targets = Vec::new();
            for sub in subs.iter() {
                if event.topic.starts_with(&sub.prefix) && !seen.contains(&sub.owner.as_str()) {
                    seen.push(&sub.owner);
                    targets.push(sub.subscriber.clone());
                }
            }
            targets
        };

        for subscriber in &targets {
            subscriber.on_publish(event);
        }
        targets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        topics: Mutex<Vec<String>>,
    }

    impl Subscriber for Recorder {
        fn on_publish(&self, event: &PublishEvent) {
            self.topics.lock().unwrap().push(event.topic.clone());
        }
    }

    #[test]
    fn test_prefix_routing() {
        let bus = MemoryBus::new();
        let rec = Arc::new(Recorder::default());
        bus.subscribe("g", "devices/", rec.clone());

        assert_eq!(bus.publish(&PublishEvent::new("devices/ahu/all", Value::Null)), 1);
        assert_eq!(bus.publish(&PublishEvent::new("weather/now", Value::Null)), 0);
        assert_eq!(*rec.topics.lock().unwrap(), vec!["devices/ahu/all"]);
    }

    #[test]
    fn test_owner_receives_once() {
        let bus = MemoryBus::new();
        let rec = Arc::new(Recorder::default());
        bus.subscribe("g", "devices/", rec.clone());
        bus.subscribe("g", "devices/ahu", rec.clone());
        bus.subscribe("g", "devices/ahu", rec.clone());
        assert_eq!(bus.subscription_count(), 2);

        bus.publish(&PublishEvent::new("devices/ahu/all", Value::Null));
        assert_eq!(rec.topics.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_unsubscribe_is_scoped_to_owner() {
        let bus = MemoryBus::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        bus.subscribe("a", "t", a.clone());
        bus.subscribe("b", "t", b.clone());

        bus.unsubscribe("a", "t");
        bus.unsubscribe("a", "t");
        bus.publish(&PublishEvent::new("t", Value::Null));

        assert!(a.topics.lock().unwrap().is_empty());
        assert_eq!(b.topics.lock().unwrap().len(), 1);
    }
}
