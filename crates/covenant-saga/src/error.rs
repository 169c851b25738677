//! Saga error types.

use std::time::Duration;

use thiserror::Error;

use crate::saga::SagaState;

/// Errors raised by the saga orchestrator and its store.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SagaError {
    /// No saga with this id is known.
    #[error("saga not found: {0}")]
    NotFound(String),

    /// The operation is not allowed in the saga's current state.
    #[error("cannot {operation} saga {saga_id} in state {state}")]
    InvalidState {
        /// The saga the operation targeted.
        saga_id: String,
        /// The state it was in.
        state: SagaState,
        /// The rejected operation.
        operation: &'static str,
    },

    /// The saga definition is malformed.
    #[error("invalid saga: {0}")]
    Validation(String),

    /// A step attempt exceeded its deadline.
    #[error("step {step_id} timed out after {timeout:?}")]
    Timeout {
        /// The step that timed out.
        step_id: String,
        /// The deadline it exceeded.
        timeout: Duration,
    },

    /// A step's command handler reported failure.
    #[error("step {step_id} failed: {reason}")]
    StepFailed {
        /// The failing step.
        step_id: String,
        /// The handler's error message.
        reason: String,
    },

    /// A compensation command failed. Recorded, never fatal.
    #[error("compensation of step {step_id} failed: {reason}")]
    Compensation {
        /// The step being compensated.
        step_id: String,
        /// Why the compensation failed.
        reason: String,
    },

    /// Cancellation was requested while the step was waiting to retry.
    #[error("saga cancelled")]
    Cancelled,

    /// The command bus could not dispatch a step command. Never retried.
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// The saga store failed.
    #[error("saga store error: {0}")]
    Store(String),
}
