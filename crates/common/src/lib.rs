//! Shared types for the aggregate persistence workspace.

pub mod clock;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use types::AggregateId;

#[doc(hidden)]
pub use uuid::{Error as UuidError, Uuid};
