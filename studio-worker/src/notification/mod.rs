//! Notification sink for job and entity events.
//!
//! The engine only publishes; routing a [`Notification`] to the user's live
//! connection is the subscriber's business.

mod events;

pub use events::{EntityChangeEvent, JobEvent, Notification, WorkerEvent};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::trace;

use crate::Result;

/// Destination for worker notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, notification: Notification) -> Result<()>;
}

/// Fans notifications out over a broadcast channel.
pub struct BroadcastNotifier {
    sender: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    /// Create a new notifier with default capacity (256).
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for BroadcastNotifier {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

#[async_trait]
impl NotificationSink for BroadcastNotifier {
    async fn publish(&self, notification: Notification) -> Result<()> {
        let event_type = notification.event.event_type();
        match self.sender.send(notification) {
            Ok(receivers) => trace!(event_type, receivers, "Notification published"),
            // Nobody listening right now.
            Err(_) => trace!(event_type, "Notification dropped, no subscribers"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{EntityKind, EntityRef, EntityStatus};

    fn entity_changed() -> Notification {
        Notification::entity_changed(
            "user-1",
            &EntityRef::new(EntityKind::Infographic, "ig-1"),
            EntityStatus::Failed,
            Some("timed out".into()),
        )
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let notifier = BroadcastNotifier::new();
        let mut rx = notifier.subscribe();
        assert_eq!(notifier.subscriber_count(), 1);

        notifier.publish(entity_changed()).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.user_id, "user-1");
        assert!(matches!(received.event, WorkerEvent::EntityChanged(_)));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let notifier = BroadcastNotifier::default();
        assert!(notifier.publish(entity_changed()).await.is_ok());
    }
}
