//! Topic-per-call pub/sub for stream subscribers.
//!
//! Each call id maps to a `tokio::sync::broadcast` channel. Publishing never
//! blocks: a subscriber that falls behind loses its oldest pending messages
//! (broadcast lag) rather than stalling the publisher or its peers.

use dashmap::DashMap;
use tokio::sync::broadcast;

use super::Envelope;

/// Per-subscriber channel capacity; overflow drops oldest.
pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

/// In-process fan-out of envelopes, one topic per call.
pub struct CallEventBus {
    topics: DashMap<String, broadcast::Sender<Envelope>>,
}

impl CallEventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
        }
    }

    /// Subscribes to a call's topic, creating it on first use.
    pub fn subscribe(&self, call_id: &str) -> broadcast::Receiver<Envelope> {
        self.topics
            .entry(call_id.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publishes an envelope to a call's topic.
    ///
    /// Best-effort: with no live subscribers the envelope is dropped and the
    /// idle topic is garbage-collected.
    pub fn publish(&self, call_id: &str, envelope: Envelope) {
        let Some(sender) = self.topics.get(call_id).map(|r| r.value().clone()) else {
            return;
        };
        if sender.send(envelope).is_err() {
            // All receivers gone; drop the topic so idle calls don't
            // accumulate channels.
            self.topics
                .remove_if(call_id, |_, s| s.receiver_count() == 0);
            log::trace!("[EventBus] No subscribers for {}, topic released", call_id);
        }
    }

    /// Number of live subscribers on a call's topic.
    #[must_use]
    pub fn subscriber_count(&self, call_id: &str) -> usize {
        self.topics
            .get(call_id)
            .map(|r| r.receiver_count())
            .unwrap_or(0)
    }

    /// Number of topics currently held.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

impl Default for CallEventBus {
    fn default() -> Self {
        Self::new()
    }
}
