use tokio::sync::broadcast;

use zora_types::Envelope;

/// Fan-out of engine envelopes to dashboard subscribers. Slow consumers fall
/// behind and miss frames rather than blocking the engine.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Envelope>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn publish(&self, envelope: Envelope) {
        let _ = self.tx.send(envelope);
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
    async fn subscribers_see_published_envelopes() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Envelope::new("task.started", "orchestrator", json!({"jobId": "job-1"})));
        let envelope = rx.recv().await.expect("envelope");
        assert_eq!(envelope.event_type, "task.started");
    }
}
