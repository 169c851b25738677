//! Covenant Saga — long-running workflows with ordered compensation.
//!
//! A saga is a list of steps, each pairing an action command with the
//! command that undoes it. [`SagaOrchestrator`] runs the actions in order
//! through the command bus; when one fails (or the saga is cancelled) the
//! completed steps are compensated in reverse.

pub mod error;
pub mod orchestrator;
pub mod saga;
pub mod store;

pub use error::SagaError;
pub use orchestrator::SagaOrchestrator;
pub use saga::{CompensationFailure, RetryPolicy, SagaState, SagaStep, SagaTransaction};
pub use store::{InMemorySagaStore, SagaStore};
