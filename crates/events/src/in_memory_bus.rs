//! In-memory event bus for tests/dev.

use std::sync::{Mutex, mpsc};

use tracing::debug;

use crate::bus::{EventBus, PublishError, Subscription};
use crate::envelope::IntegrationEvent;

/// In-memory fan-out bus.
///
/// - No IO / no async
/// - Every subscriber receives a copy of every event
/// - Dead subscribers are dropped while publishing
#[derive(Debug, Default)]
pub struct InMemoryEventBus {
    subscribers: Mutex<Vec<mpsc::Sender<IntegrationEvent>>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription<IntegrationEvent> {
        let (tx, rx) = mpsc::channel();

        // A poisoned lock still yields a subscription; it just stays silent.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(&self, event: &IntegrationEvent) -> Result<(), PublishError> {
        let mut subs = self
            .subscribers
            .lock()
            .map_err(|_| PublishError::Unavailable("subscriber list poisoned".into()))?;

        subs.retain(|tx| tx.send(event.clone()).is_ok());
        debug!(
            message_id = %event.message_id(),
            event_type = event.event_type(),
            subscribers = subs.len(),
            "event published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tessera_core::MessageId;

    #[test]
    fn fans_out_to_every_subscriber() {
        let bus = InMemoryEventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        let event = IntegrationEvent::new(MessageId::new(), "Ping", Utc::now(), json!({}));
        bus.publish(&event).unwrap();

        assert_eq!(a.drain(), vec![event.clone()]);
        assert_eq!(b.drain(), vec![event]);
    }

    #[test]
    fn dropped_subscribers_do_not_fail_publishing() {
        let bus = InMemoryEventBus::new();
        drop(bus.subscribe());

        let event = IntegrationEvent::new(MessageId::new(), "Ping", Utc::now(), json!({}));
        assert!(bus.publish(&event).is_ok());
    }
}
