//! Transactional outbox.
//!
//! Integration events are written next to the domain change that produced
//! them and delivered later by [`OutboxProcessor`]:
//!
//! ```ignore
//! db.transaction(|tx| {
//!     tx.state().users.insert(user.id, user.clone());
//!     tx.append(OutboxMessage::from_event(&EmailConfirmationRequested { .. })?)?;
//!     Ok::<_, OutboxStoreError>(())
//! })?;
//!
//! // later, on the scheduler's priority queue
//! let report = processor.tick()?;
//! ```

pub mod postgres;
pub mod processor;
pub mod store;
pub mod types;

pub use postgres::PostgresOutboxStore;
pub use processor::{OutboxProcessor, TickReport};
pub use store::{InMemoryDatabase, OutboxAppend, OutboxStore, Transaction};
pub use types::{OutboxMessage, OutboxStats, OutboxStatus, OutboxStoreError};
