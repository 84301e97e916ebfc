//! Relay lifecycle notifications
//!
//! Publishing is fire-and-forget: sinks must not block and failures are
//! swallowed, since nothing in the relay depends on delivery.

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::models::relay::{RelayEvent, RelayEventType};

pub trait RelayEventSink: Send + Sync {
    fn publish(&self, event: RelayEvent);
}

/// Writes events to the log
#[derive(Debug, Clone, Default)]
pub struct TracingEventSink;

impl RelayEventSink for TracingEventSink {
    fn publish(&self, event: RelayEvent) {
        let details = event.details.as_deref().unwrap_or("");
        match event.event_type {
            RelayEventType::Start | RelayEventType::Stop => info!(
                session_id = %event.session_id,
                channel_id = %event.channel_id,
                event = ?event.event_type,
                "Relay event: {}", details
            ),
            RelayEventType::Error => warn!(
                session_id = %event.session_id,
                channel_id = %event.channel_id,
                "Relay event: error: {}", details
            ),
            _ => debug!(
                session_id = %event.session_id,
                channel_id = %event.channel_id,
                event = ?event.event_type,
                "Relay event: {}", details
            ),
        }
    }
}

/// Re-publishes events on a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<RelayEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.sender.subscribe()
    }
}

impl RelayEventSink for BroadcastEventSink {
    fn publish(&self, event: RelayEvent) {
        // no subscribers is not an error
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastEventSink::new(16);
        let mut rx = sink.subscribe();
        let id = Uuid::new_v4();
        sink.publish(RelayEvent::new(id, "ch1", RelayEventType::Start, None));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id, id);
        assert_eq!(event.event_type, RelayEventType::Start);
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let sink = BroadcastEventSink::new(1);
        sink.publish(RelayEvent::new(Uuid::new_v4(), "ch1", RelayEventType::Stop, None));
        TracingEventSink.publish(RelayEvent::new(
            Uuid::new_v4(),
            "ch1",
            RelayEventType::Error,
            Some("upstream gone".into()),
        ));
    }
}
