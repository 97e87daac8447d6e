//! `tessera-events`: integration events and the bus they are published on.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod identity;
pub mod in_memory_bus;

pub use bus::{EventBus, PublishError, Subscription};
pub use envelope::IntegrationEvent;
pub use event::Event;
pub use identity::EmailConfirmationRequested;
pub use in_memory_bus::InMemoryEventBus;
