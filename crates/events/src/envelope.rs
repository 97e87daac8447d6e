use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use tessera_core::MessageId;

use crate::event::Event;

/// The published form of an outbox message.
///
/// `message_id` is stable across redeliveries; consumers de-duplicate on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationEvent {
    message_id: MessageId,
    event_type: String,
    occurred_at: DateTime<Utc>,
    payload: JsonValue,
}

impl IntegrationEvent {
    pub fn new(
        message_id: MessageId,
        event_type: impl Into<String>,
        occurred_at: DateTime<Utc>,
        payload: JsonValue,
    ) -> Self {
        Self {
            message_id,
            event_type: event_type.into(),
            occurred_at,
            payload,
        }
    }

    /// Serialise a typed event under a fresh message id.
    pub fn from_event<E: Event>(event: &E) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            MessageId::new(),
            event.event_type(),
            event.occurred_at(),
            serde_json::to_value(event)?,
        ))
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    /// Decode the payload back into a typed event.
    pub fn decode<E: Event + serde::de::DeserializeOwned>(&self) -> Result<E, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::EmailConfirmationRequested;
    use tessera_core::UserId;

    #[test]
    fn carries_type_and_payload_of_the_event() {
        let event = EmailConfirmationRequested {
            user_id: UserId::new(),
            email: "jane@acme.test".into(),
            occurred_at: Utc::now(),
        };
        let envelope = IntegrationEvent::from_event(&event).unwrap();

        assert_eq!(envelope.event_type(), "EmailConfirmation");
        assert_eq!(envelope.payload()["email"], "jane@acme.test");
        assert_eq!(envelope.decode::<EmailConfirmationRequested>().unwrap(), event);
    }
}
