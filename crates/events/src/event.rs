use chrono::{DateTime, Utc};
use serde::Serialize;

/// A fact about identity state that other subsystems care about.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - serialised into the outbox in the same transaction as the change
pub trait Event: Clone + core::fmt::Debug + Serialize + Send + Sync + 'static {
    /// Stable event type identifier (e.g. "EmailConfirmation").
    fn event_type(&self) -> &'static str;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
