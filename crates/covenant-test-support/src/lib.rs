//! Shared test doubles for the Covenant engine.

mod determinism;
mod store;

pub use determinism::{FixedClock, MockRng, SequenceRng};
pub use store::{AppendedBatch, EmptyEventStore, FailingEventStore, RecordingEventStore};
