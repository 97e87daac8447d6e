//! `tessera-core`: identifiers, the error taxonomy and the clock.
//!
//! This crate has no infrastructure concerns.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{MessageId, RefreshTokenId, TeamId, UserId};
