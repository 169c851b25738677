//! Saga definitions and the saga state machine.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use covenant_core::command::Command;
use covenant_core::rng::DeterministicRng;

use crate::error::SagaError;

/// Lifecycle of a saga.
///
/// `Created -> Executing -> Completed` on the happy path,
/// `Executing -> Compensating -> Compensated` after a failure, and
/// `Executing -> Failed` when compensation cannot be attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaState {
    /// Defined but not started.
    Created,
    /// Running its actions in order.
    Executing,
    /// Undoing completed steps in reverse.
    Compensating,
    /// Every action succeeded.
    Completed,
    /// Every completed step was compensated (best effort).
    Compensated,
    /// Compensation could not be attempted.
    Failed,
}

impl SagaState {
    /// Returns `true` for `Completed`, `Compensated` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Compensated | Self::Failed)
    }

    /// Returns `true` if the state machine allows `self -> next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Executing)
                | (
                    Self::Executing,
                    Self::Completed | Self::Compensating | Self::Failed
                )
                | (Self::Compensating, Self::Compensated)
        )
    }
}

impl fmt::Display for SagaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "CREATED",
            Self::Executing => "EXECUTING",
            Self::Compensating => "COMPENSATING",
            Self::Completed => "COMPLETED",
            Self::Compensated => "COMPENSATED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// How often and how patiently a step command is retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first. At least 1.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound on any delay.
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays. At least 1.0.
    pub multiplier: f64,
    /// Randomize each delay between half and all of its nominal value.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes a single attempt.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::default()
    }

    /// Exponential backoff with jitter, up to `max_attempts` attempts.
    #[must_use]
    pub fn exponential(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            ..Self::default()
        }
    }

    /// Checks the policy parameters.
    ///
    /// # Errors
    ///
    /// Returns `SagaError::Validation` for zero attempts or a multiplier
    /// below 1.0.
    pub fn validate(&self) -> Result<(), SagaError> {
        if self.max_attempts == 0 {
            return Err(SagaError::Validation(
                "retry policy needs at least one attempt".into(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(SagaError::Validation(format!(
                "retry multiplier must be a finite value >= 1.0, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn backoff(&self, attempt: u32, rng: &mut dyn DeterministicRng) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let cap = self.max_backoff.as_nanos() as f64;
        let nominal = (self.initial_backoff.as_nanos() as f64 * self.multiplier.powi(exponent))
            .round()
            .min(cap)
            .max(0.0);
        let nanos = if self.jitter {
            let half = (nominal / 2.0).floor();
            half + (rng.next_f64() * half).round()
        } else {
            nominal
        };
        Duration::from_nanos(nanos as u64)
    }
}

/// One unit of work and the command that undoes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStep {
    /// Identifier, unique within the saga.
    pub step_id: String,
    /// Command performing the step.
    pub action: Command,
    /// Command undoing the step.
    pub compensation: Command,
    /// Deadline for each attempt of either command.
    pub timeout: Duration,
    /// Retry policy for either command.
    pub retry_policy: RetryPolicy,
}

impl SagaStep {
    /// A step with a 30 second timeout and no retries.
    #[must_use]
    pub fn new(step_id: impl Into<String>, action: Command, compensation: Command) -> Self {
        Self {
            step_id: step_id.into(),
            action,
            compensation,
            timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::no_retry(),
        }
    }

    /// Sets the per-attempt deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }
}

/// A compensation that failed, kept for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationFailure {
    /// The step whose compensation failed.
    pub step_id: String,
    /// Error message.
    pub error: String,
}

/// A saga instance and its progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaTransaction {
    /// Unique saga id.
    pub saga_id: String,
    /// Workflow name, e.g. `order_fulfillment`.
    pub saga_type: String,
    /// Steps in execution order.
    pub steps: Vec<SagaStep>,
    /// Current state.
    pub state: SagaState,
    /// Index of the step being (or last) executed.
    pub current_step_index: usize,
    /// Steps whose action succeeded, in completion order.
    pub completed_steps: Vec<String>,
    /// Steps compensated so far, in compensation order.
    pub compensated_steps: Vec<String>,
    /// Shared key/value bag. Each step's result is stored under its id.
    pub context: Map<String, Value>,
    /// Why forward progress stopped.
    pub failure: Option<String>,
    /// Compensations that failed.
    pub compensation_failures: Vec<CompensationFailure>,
    /// When the saga was defined.
    pub created_at: DateTime<Utc>,
    /// When the saga last changed.
    pub updated_at: DateTime<Utc>,
}

impl SagaTransaction {
    /// Defines a new saga in the `Created` state.
    #[must_use]
    pub fn new(saga_type: impl Into<String>, steps: Vec<SagaStep>, now: DateTime<Utc>) -> Self {
        Self {
            saga_id: Uuid::new_v4().to_string(),
            saga_type: saga_type.into(),
            steps,
            state: SagaState::Created,
            current_step_index: 0,
            completed_steps: Vec::new(),
            compensated_steps: Vec::new(),
            context: Map::new(),
            failure: None,
            compensation_failures: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Overrides the generated saga id.
    #[must_use]
    pub fn with_id(mut self, saga_id: impl Into<String>) -> Self {
        self.saga_id = saga_id.into();
        self
    }

    /// Seeds the shared context.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Looks a step up by id.
    #[must_use]
    pub fn step(&self, step_id: &str) -> Option<&SagaStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Checks the definition: unique step ids and valid retry policies.
    ///
    /// # Errors
    ///
    /// Returns `SagaError::Validation` describing the first problem found.
    pub fn validate(&self) -> Result<(), SagaError> {
        if self.saga_id.trim().is_empty() {
            return Err(SagaError::Validation("saga id must not be empty".into()));
        }
        for (index, step) in self.steps.iter().enumerate() {
            if self.steps[..index].iter().any(|s| s.step_id == step.step_id) {
                return Err(SagaError::Validation(format!(
                    "duplicate step id `{}`",
                    step.step_id
                )));
            }
            step.retry_policy.validate()?;
        }
        Ok(())
    }

    /// Moves to `next` if the state machine allows it.
    ///
    /// # Errors
    ///
    /// Returns `SagaError::InvalidState` for an illegal transition.
    pub fn transition_to(
        &mut self,
        next: SagaState,
        now: DateTime<Utc>,
    ) -> Result<(), SagaError> {
        if !self.state.can_transition_to(next) {
            return Err(SagaError::InvalidState {
                saga_id: self.saga_id.clone(),
                state: self.state,
                operation: "transition",
            });
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use covenant_test_support::{MockRng, SequenceRng};

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap()
    }

    fn step(id: &str) -> SagaStep {
        SagaStep::new(
            id,
            Command::new("do", "target", Value::Null),
            Command::new("undo", "target", Value::Null),
        )
    }

    #[test]
    fn test_state_machine_allows_only_documented_transitions() {
        use SagaState::{Compensated, Compensating, Completed, Created, Executing, Failed};

        assert!(Created.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Completed));
        assert!(Executing.can_transition_to(Compensating));
        assert!(Executing.can_transition_to(Failed));
        assert!(Compensating.can_transition_to(Compensated));

        assert!(!Created.can_transition_to(Completed));
        assert!(!Compensating.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Compensating));
        assert!(!Compensated.can_transition_to(Executing));
        assert!(!Failed.can_transition_to(Compensating));
    }

    #[test]
    fn test_transition_to_rejects_illegal_move() {
        let mut saga = SagaTransaction::new("order_fulfillment", vec![], now()).with_id("s-1");

        let result = saga.transition_to(SagaState::Completed, now());

        assert!(matches!(
            result,
            Err(SagaError::InvalidState {
                state: SagaState::Created,
                ..
            })
        ));
        assert_eq!(saga.state, SagaState::Created);
    }

    #[test]
    fn test_validate_rejects_duplicate_step_ids() {
        let saga = SagaTransaction::new("order_fulfillment", vec![step("a"), step("a")], now());

        assert!(matches!(saga.validate(), Err(SagaError::Validation(_))));
    }

    #[test]
    fn test_backoff_grows_exponentially_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            multiplier: 2.0,
            jitter: false,
        };

        let delays: Vec<_> = (1..=4).map(|a| policy.backoff(a, &mut MockRng)).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(350),
                Duration::from_millis(350),
            ]
        );
    }

    #[test]
    fn test_jitter_draws_between_half_and_full_delay() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(200));
        let mut rng = SequenceRng::new(vec![0, 50]);

        let low = policy.backoff(1, &mut rng);
        let mid = policy.backoff(1, &mut rng);

        assert_eq!(low, Duration::from_millis(100));
        assert_eq!(mid, Duration::from_millis(150));
    }

    #[test]
    fn test_state_serializes_in_screaming_case() {
        let json = serde_json::to_value(SagaState::Compensated).unwrap();

        assert_eq!(json, serde_json::json!("COMPENSATED"));
        assert_eq!(SagaState::Compensated.to_string(), "COMPENSATED");
    }
}
