//! Append-only event store boundary.
//!
//! Streams are keyed by `(tenant_id, aggregate_id)`; each stream carries a
//! single aggregate type and a gapless sequence starting at 1. The in-memory
//! store backs tests and local runs, Postgres backs deployments.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
