use tokio::sync::broadcast;

use convoy_types::EngineEvent;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Events published with no subscriber are dropped.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::new(
            "attempt.queued",
            json!({ "attemptID": "a-1" }),
        ));
        let event = rx.recv().await.expect("event");
        assert_eq!(event.event_type, "attempt.queued");
        assert_eq!(event.property_str("attemptID"), Some("a-1"));
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        EventBus::new().publish(EngineEvent::new("autopilot.updated", json!({})));
    }
}
