//! Cross-tab publish/subscribe.
//!
//! # Data Flow
//! ```text
//! DataConsistencyService::sync_across_tabs
//!     → TopicBroadcaster::publish("data_sync_{entity}", message)
//!     → every live subscriber of that topic (other tabs, other components)
//! ```
//!
//! # Design Decisions
//! - Best effort: publishing with no subscribers is not an error
//! - No ordering or acknowledgement guarantees across topics
//! - Slow subscribers lose the oldest messages instead of blocking publishers

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;

/// Messages buffered per topic before slow subscribers start lagging.
const TOPIC_CAPACITY: usize = 64;

/// A topic-based broadcaster.
pub trait TopicBroadcaster: Send + Sync {
    /// Publish `message` to every current subscriber of `topic`.
    fn publish(&self, topic: &str, message: Value);

    /// Subscribe to future messages on `topic`.
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Value>;
}

/// In-process broadcaster backed by one tokio broadcast channel per topic.
#[derive(Debug, Default)]
pub struct LocalBroadcaster {
    topics: DashMap<String, broadcast::Sender<Value>>,
}

impl LocalBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl TopicBroadcaster for LocalBroadcaster {
    fn publish(&self, topic: &str, message: Value) {
        let Some(tx) = self.topics.get(topic).map(|r| r.value().clone()) else {
            tracing::trace!(topic = %topic, "No subscribers, dropping message");
            return;
        };
        match tx.send(message) {
            Ok(delivered) => tracing::trace!(topic = %topic, delivered, "Message published"),
            Err(_) => {
                // Every receiver is gone; drop the topic unless someone re-subscribed meanwhile.
                self.topics.remove_if(topic, |_, tx| tx.receiver_count() == 0);
            }
        }
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<Value> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }
}
