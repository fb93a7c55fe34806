//! In-process pub/sub, topics keyed by strings like `agent:<id>`, `team:<id>`,
//! `system`.
//!
//! New code: tftio-gator's only fan-in channel (`orchestrator::LifecycleDone`)
//! is a single-consumer result channel, not a topic registry. Each subscriber
//! gets its own bounded queue so one slow subscriber can't starve another;
//! overflow drops the oldest queued item rather than blocking the publisher
//! or dropping the newest one.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::Notify;
use uuid::Uuid;

const DEFAULT_CAPACITY: usize = 256;

struct SubQueue {
    items: Mutex<VecDeque<Value>>,
    notify: Notify,
    capacity: usize,
}

impl SubQueue {
    fn push(&self, value: Value) {
        let mut items = self.items.lock().unwrap();
        if items.len() >= self.capacity {
            items.pop_front();
        }
        items.push_back(value);
        drop(items);
        self.notify.notify_one();
    }
}

type TopicMap = HashMap<String, HashMap<Uuid, Arc<SubQueue>>>;

struct Inner {
    topics: Mutex<TopicMap>,
}

/// Cheaply cloneable handle to the bus; all clones share the same registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to a topic with the default per-subscriber queue capacity.
    pub fn subscribe(&self, topic: impl Into<String>) -> Subscription {
        self.subscribe_with_capacity(topic, DEFAULT_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, topic: impl Into<String>, capacity: usize) -> Subscription {
        let topic = topic.into();
        let id = Uuid::new_v4();
        let queue = Arc::new(SubQueue {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        });

        self.inner
            .topics
            .lock()
            .unwrap()
            .entry(topic.clone())
            .or_default()
            .insert(id, queue.clone());

        Subscription {
            bus: self.clone(),
            topic,
            id,
            queue,
        }
    }

    /// Publish a payload to every current subscriber of `topic`. Subscribers
    /// that join after this call do not see it (no replay).
    pub fn publish(&self, topic: &str, payload: Value) {
        let topics = self.inner.topics.lock().unwrap();
        let Some(subs) = topics.get(topic) else {
            return;
        };
        for queue in subs.values() {
            queue.push(payload.clone());
        }
    }

    fn unsubscribe(&self, topic: &str, id: Uuid) {
        let mut topics = self.inner.topics.lock().unwrap();
        if let Some(subs) = topics.get_mut(topic) {
            subs.remove(&id);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    bus: EventBus,
    topic: String,
    id: Uuid,
    queue: Arc<SubQueue>,
}

impl Subscription {
    /// Wait for and return the next published payload on this topic.
    pub async fn recv(&self) -> Value {
        loop {
            if let Some(value) = self.queue.items.lock().unwrap().pop_front() {
                return value;
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.topic, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_is_delivered_to_subscriber() {
        let bus = EventBus::new();
        let sub = bus.subscribe("agent:1");
        bus.publish("agent:1", serde_json::json!({"status": "running"}));
        let got = sub.recv().await;
        assert_eq!(got["status"], "running");
    }

    #[tokio::test]
    async fn publish_to_unsubscribed_topic_is_a_no_op() {
        let bus = EventBus::new();
        bus.publish("system", serde_json::json!({}));
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let bus = EventBus::new();
        let sub = bus.subscribe_with_capacity("team:1", 2);
        bus.publish("team:1", serde_json::json!(1));
        bus.publish("team:1", serde_json::json!(2));
        bus.publish("team:1", serde_json::json!(3));
        assert_eq!(sub.recv().await, serde_json::json!(2));
        assert_eq!(sub.recv().await, serde_json::json!(3));
    }

    #[tokio::test]
    async fn drop_unsubscribes() {
        let bus = EventBus::new();
        {
            let _sub = bus.subscribe("system");
            assert_eq!(bus.inner.topics.lock().unwrap().len(), 1);
        }
        assert_eq!(bus.inner.topics.lock().unwrap().len(), 0);
    }
}
