//! Append-only event store boundary.
//!
//! One stream per agency, keyed by `AgencyId`. The trait makes no storage
//! assumptions; the in-memory store backs tests and single-process runs, the
//! Postgres store (feature `postgres`) backs deployments.

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, StreamAppend, UncommittedEvent};
