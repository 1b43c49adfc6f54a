//! Fan-out of presence updates to every realtime connection in this process.

use serde::Serialize;
use tokio::sync::broadcast;

/// Event pushed to all connected realtime clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenceEvent {
    ActiveCountChanged { count: i64 },
}

#[derive(Clone)]
pub struct PresenceBroadcaster {
    tx: broadcast::Sender<PresenceEvent>,
}

impl PresenceBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes the count to all current subscribers.
    ///
    /// Returns the number of subscribers reached; zero subscribers is not an error.
    pub fn publish_count(&self, count: i64) -> usize {
        match self.tx.send(PresenceEvent::ActiveCountChanged { count }) {
            Ok(receivers) => {
                tracing::debug!(count, receivers, "Broadcast active session count");
                receivers
            }
            Err(_) => {
                tracing::trace!(count, "No realtime subscribers for active session count");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let broadcaster = PresenceBroadcaster::new(8);
        let mut first = broadcaster.subscribe();
        let mut second = broadcaster.subscribe();

        assert_eq!(broadcaster.publish_count(3), 2);

        assert_eq!(
            first.recv().await.expect("first receives"),
            PresenceEvent::ActiveCountChanged { count: 3 }
        );
        assert_eq!(
            second.recv().await.expect("second receives"),
            PresenceEvent::ActiveCountChanged { count: 3 }
        );
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let broadcaster = PresenceBroadcaster::new(8);
        assert_eq!(broadcaster.publish_count(1), 0);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn repeated_counts_are_not_deduplicated() {
        let broadcaster = PresenceBroadcaster::new(8);
        let mut rx = broadcaster.subscribe();

        broadcaster.publish_count(2);
        broadcaster.publish_count(2);

        assert_eq!(
            rx.recv().await.expect("first"),
            PresenceEvent::ActiveCountChanged { count: 2 }
        );
        assert_eq!(
            rx.recv().await.expect("second"),
            PresenceEvent::ActiveCountChanged { count: 2 }
        );
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let json = serde_json::to_value(PresenceEvent::ActiveCountChanged { count: 4 })
            .expect("serialize");
        assert_eq!(json["type"], "active_count_changed");
        assert_eq!(json["count"], 4);
    }
}
