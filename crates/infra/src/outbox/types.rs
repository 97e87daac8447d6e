//! Outbox rows and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use tessera_core::{DomainError, MessageId};
use tessera_events::{Event, IntegrationEvent};

/// One pending (or delivered) integration event.
///
/// Written in the same transaction as the change that produced it. After that
/// only `processed_on_utc`, `error` and the claim bookkeeping ever change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: MessageId,
    pub message_type: String,
    pub content: JsonValue,
    pub created_on_utc: DateTime<Utc>,
    pub processed_on_utc: Option<DateTime<Utc>>,
    /// Last publish failure; cleared once a publish succeeds.
    pub error: Option<String>,
    /// Number of times the message has been claimed.
    pub attempts: u32,
    pub claimed_by: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    pub fn new(
        message_type: impl Into<String>,
        content: JsonValue,
        created_on_utc: DateTime<Utc>,
    ) -> Self {
        Self::with_id(MessageId::new(), message_type, content, created_on_utc)
    }

    pub fn with_id(
        id: MessageId,
        message_type: impl Into<String>,
        content: JsonValue,
        created_on_utc: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            message_type: message_type.into(),
            content,
            created_on_utc,
            processed_on_utc: None,
            error: None,
            attempts: 0,
            claimed_by: None,
            claimed_until: None,
        }
    }

    /// Serialise a typed event into a new message.
    pub fn from_event<E: Event>(event: &E) -> Result<Self, OutboxStoreError> {
        let content = serde_json::to_value(event)
            .map_err(|e| OutboxStoreError::Serialization(e.to_string()))?;
        Ok(Self::new(event.event_type(), content, event.occurred_at()))
    }

    pub fn is_processed(&self) -> bool {
        self.processed_on_utc.is_some()
    }

    /// Unprocessed and not held by a live claim.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        !self.is_processed() && self.claimed_until.is_none_or(|until| until <= now)
    }

    pub fn status(&self) -> OutboxStatus {
        match (&self.processed_on_utc, &self.error) {
            (Some(_), _) => OutboxStatus::Processed,
            (None, Some(_)) => OutboxStatus::Errored,
            (None, None) => OutboxStatus::Pending,
        }
    }

    /// The form handed to the event bus.
    pub fn to_integration_event(&self) -> IntegrationEvent {
        IntegrationEvent::new(
            self.id,
            self.message_type.clone(),
            self.created_on_utc,
            self.content.clone(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    /// Last publish failed; retried on the next poll.
    Errored,
    Processed,
}

/// Counts for operational dashboards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending: usize,
    pub errored: usize,
    pub processed: usize,
    /// Unprocessed messages currently held by a live claim.
    pub claimed: usize,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OutboxStoreError {
    #[error("outbox message not found: {0}")]
    NotFound(MessageId),

    #[error("outbox message already exists: {0}")]
    Duplicate(MessageId),

    /// The caller's claim expired and the message now belongs to someone else
    /// (or was already settled).
    #[error("claim on outbox message {id} lost by '{owner}'")]
    ClaimLost { id: MessageId, owner: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<OutboxStoreError> for DomainError {
    fn from(err: OutboxStoreError) -> Self {
        match err {
            OutboxStoreError::NotFound(_) => DomainError::NotFound,
            OutboxStoreError::Duplicate(_) => DomainError::Conflict(err.to_string()),
            OutboxStoreError::ClaimLost { .. }
            | OutboxStoreError::Serialization(_)
            | OutboxStoreError::Storage(_) => DomainError::Fatal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn lease_controls_claimability() {
        let now = Utc::now();
        let mut message = OutboxMessage::new("EmailConfirmation", json!({}), now);
        assert!(message.is_claimable(now));

        message.claimed_by = Some("worker-a".into());
        message.claimed_until = Some(now + Duration::minutes(5));
        assert!(!message.is_claimable(now));
        assert!(message.is_claimable(now + Duration::minutes(5)));

        message.processed_on_utc = Some(now);
        assert!(!message.is_claimable(now + Duration::hours(1)));
    }

    #[test]
    fn status_follows_processed_and_error() {
        let now = Utc::now();
        let mut message = OutboxMessage::new("EmailConfirmation", json!({}), now);
        assert_eq!(message.status(), OutboxStatus::Pending);

        message.error = Some("broker down".into());
        assert_eq!(message.status(), OutboxStatus::Errored);

        message.processed_on_utc = Some(now);
        assert_eq!(message.status(), OutboxStatus::Processed);
    }
}
