//! Aggregate contracts and the repository that persists them.
//!
//! - [`Aggregate`] and [`SnapshotCapable`] describe what an aggregate must
//!   provide to be rebuilt from events and captured in snapshots
//! - [`AggregateRepository`] loads aggregates from a snapshot plus the events
//!   after it, appends the events commands produce, and consults a
//!   [`snapshot_store::SnapshotStrategy`] after every append

pub mod aggregate;
pub mod error;
pub mod repository;

pub use aggregate::{Aggregate, DomainEvent, SnapshotCapable};
pub use error::DomainError;
pub use repository::{AggregateRepository, CommandResult};
