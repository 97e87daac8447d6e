//! Integration events raised by identity state changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tessera_core::UserId;

use crate::event::Event;

/// A confirmation email must be sent to `email`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailConfirmationRequested {
    pub user_id: UserId,
    pub email: String,
    pub occurred_at: DateTime<Utc>,
}

impl Event for EmailConfirmationRequested {
    fn event_type(&self) -> &'static str {
        "EmailConfirmation"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}
