use super::types::{OrchestrationEvent, PublishedEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Broadcast publisher for orchestration lifecycle events
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<PublishedEvent>,
    published: Arc<AtomicU64>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish to current subscribers. Having none is fine.
    pub fn publish(&self, event: OrchestrationEvent) {
        trace!(event = event.name(), "Publishing orchestration event");
        self.published.fetch_add(1, Ordering::Relaxed);
        let _ = self.sender.send(PublishedEvent {
            event,
            published_at: chrono::Utc::now(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Events published since creation, with or without subscribers
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_publish_without_subscribers() {
        let publisher = EventPublisher::new(8);
        publisher.publish(OrchestrationEvent::InvocationCancelled {
            runtime_id: Uuid::new_v4(),
        });
        assert_eq!(publisher.subscriber_count(), 0);
        assert_eq!(publisher.published_count(), 1);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let publisher = EventPublisher::new(8);
        let mut receiver = publisher.subscribe();
        let runtime_id = Uuid::new_v4();

        publisher.publish(OrchestrationEvent::InvocationCancelled { runtime_id });
        publisher.publish(OrchestrationEvent::ResponseDiscarded {
            correlation_id: None,
            reason: "unknown".to_string(),
        });

        let first = receiver.recv().await.unwrap();
        assert_eq!(first.event.runtime_id(), Some(runtime_id));
        let second = receiver.recv().await.unwrap();
        assert_eq!(second.event.name(), "response.discarded");
    }
}
