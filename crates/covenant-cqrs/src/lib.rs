//! Covenant CQRS — command/query dispatch and read-model projections.
//!
//! Commands and queries are routed by type to exactly one handler. Handler
//! failures (including panics) are reported as unsuccessful results; only
//! malformed requests and missing handlers surface as errors. Read models
//! are kept up to date by [`ProjectionManager`], which polls the event
//! store's by-type index and tracks its progress in a [`CheckpointStore`].

pub mod checkpoint;
pub mod command_bus;
pub mod handler;
pub mod projection;
pub mod query_bus;

pub use checkpoint::{CheckpointStore, InMemoryCheckpointStore, ProjectionCheckpoint};
pub use command_bus::CommandBus;
pub use handler::{
    CommandHandler, ProjectionHandler, QueryHandler, command_handler_fn, projection_handler_fn,
    query_handler_fn,
};
pub use projection::ProjectionManager;
pub use query_bus::QueryBus;
