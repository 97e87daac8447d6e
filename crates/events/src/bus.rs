//! Event publishing abstraction (mechanics only).
//!
//! The outbox processor is the only publisher. It hands every message to
//! [`EventBus::publish`] and records the outcome in the outbox, so a bus
//! failure never reaches the request that produced the event.
//!
//! Delivery is **at-least-once**: a message may be published again after a
//! crash or an expired claim. Consumers must be idempotent or de-duplicate
//! on [`IntegrationEvent::message_id`].

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use thiserror::Error;

use tessera_core::DomainError;

use crate::envelope::IntegrationEvent;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Broker unreachable, full, or timed out. Retried on the next tick.
    #[error("event bus unavailable: {0}")]
    Unavailable(String),
}

impl From<PublishError> for DomainError {
    fn from(err: PublishError) -> Self {
        DomainError::TransientDelivery(err.to_string())
    }
}

/// Destination for integration events.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: &IntegrationEvent) -> Result<(), PublishError>;
}

impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    fn publish(&self, event: &IntegrationEvent) -> Result<(), PublishError> {
        (**self).publish(event)
    }
}

/// A receiving end of an in-process bus.
///
/// Designed for single-threaded consumption:
///
/// ```ignore
/// let subscription = bus.subscribe();
/// loop {
///     match subscription.recv_timeout(Duration::from_secs(1)) {
///         Ok(event) => handle(event)?,
///         Err(RecvTimeoutError::Timeout) => continue,
///         Err(RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything already delivered, without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}
