//! Covenant Event Store — storage backends for the `EventStore` contract.
//!
//! [`InMemoryEventStore`] is the reference backend used by tests and
//! single-process deployments. [`PgEventStore`] persists streams and
//! snapshots in PostgreSQL.

pub mod in_memory;
pub mod pg_event_store;
pub mod schema;

pub use in_memory::InMemoryEventStore;
pub use pg_event_store::PgEventStore;
