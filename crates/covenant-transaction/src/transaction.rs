//! Distributed transaction records and their state machine.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TransactionError;

/// Lifecycle of a distributed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    /// Registered, nothing sent yet.
    Started,
    /// Prepare requests are in flight.
    Preparing,
    /// Every participant voted yes.
    Prepared,
    /// Commit requests are in flight.
    Committing,
    /// Every participant committed.
    Committed,
    /// Abort requests are in flight.
    Aborting,
    /// Every participant was told to abort.
    Aborted,
    /// A commit call failed after a unanimous prepare.
    Failed,
}

impl TransactionState {
    /// Returns `true` for `Committed`, `Aborted` and `Failed`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted | Self::Failed)
    }

    /// Returns `true` if the watchdog may still force an abort.
    #[must_use]
    pub fn is_abortable(self) -> bool {
        matches!(self, Self::Started | Self::Preparing | Self::Prepared)
    }

    /// Returns `true` if moving from `self` to `next` is legal.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use TransactionState::{
            Aborted, Aborting, Committed, Committing, Failed, Prepared, Preparing, Started,
        };
        matches!(
            (self, next),
            (Started, Preparing | Aborting)
                | (Preparing, Prepared | Aborting)
                | (Prepared, Committing | Aborting)
                | (Committing, Committed | Failed)
                | (Aborting, Aborted)
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Started => "STARTED",
            Self::Preparing => "PREPARING",
            Self::Prepared => "PREPARED",
            Self::Committing => "COMMITTING",
            Self::Committed => "COMMITTED",
            Self::Aborting => "ABORTING",
            Self::Aborted => "ABORTED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// A resource manager taking part in a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionParticipant {
    /// Unique within its transaction.
    pub participant_id: String,
    /// Where the participant client should send calls.
    pub endpoint: String,
    /// The kind of resource behind the endpoint, e.g. `postgres`.
    pub resource_manager: String,
}

impl TransactionParticipant {
    /// Creates a participant.
    #[must_use]
    pub fn new(
        participant_id: impl Into<String>,
        endpoint: impl Into<String>,
        resource_manager: impl Into<String>,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            endpoint: endpoint.into(),
            resource_manager: resource_manager.into(),
        }
    }
}

/// Protocol phase of a participant call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionPhase {
    Prepare,
    Commit,
    Abort,
}

impl fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Prepare => "prepare",
            Self::Commit => "commit",
            Self::Abort => "abort",
        })
    }
}

/// The answer one participant gave in one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantOutcome {
    pub participant_id: String,
    pub phase: TransactionPhase,
    /// `true` only for an explicit yes.
    pub acknowledged: bool,
    /// Transport error or timeout, if the call produced no vote.
    pub error: Option<String>,
}

impl ParticipantOutcome {
    /// Describes why this outcome is not an acknowledgement.
    #[must_use]
    pub fn describe_refusal(&self) -> String {
        match &self.error {
            Some(error) => format!(
                "participant {} failed to {}: {error}",
                self.participant_id, self.phase
            ),
            None => format!(
                "participant {} refused to {}",
                self.participant_id, self.phase
            ),
        }
    }
}

/// A transaction spanning several participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedTransaction {
    pub transaction_id: String,
    pub participants: Vec<TransactionParticipant>,
    pub state: TransactionState,
    /// Deadline for reaching a commit decision, measured from `begin`.
    pub timeout: Duration,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Every participant answer, in the order received.
    pub outcomes: Vec<ParticipantOutcome>,
    pub failure: Option<String>,
}

impl DistributedTransaction {
    /// Creates a `Started` transaction with a fresh id.
    #[must_use]
    pub fn new(
        participants: Vec<TransactionParticipant>,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_id: Uuid::new_v4().to_string(),
            participants,
            state: TransactionState::Started,
            timeout,
            created_at: now,
            updated_at: now,
            outcomes: Vec::new(),
            failure: None,
        }
    }

    /// Replaces the generated id.
    #[must_use]
    pub fn with_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = transaction_id.into();
        self
    }

    /// Outcomes recorded for `phase`.
    pub fn outcomes_for(&self, phase: TransactionPhase) -> impl Iterator<Item = &ParticipantOutcome> {
        self.outcomes.iter().filter(move |o| o.phase == phase)
    }

    /// Checks that the transaction can be run.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::Validation` for a blank id, no
    /// participants, a blank or repeated participant id, or a zero timeout.
    pub fn validate(&self) -> Result<(), TransactionError> {
        if self.transaction_id.trim().is_empty() {
            return Err(TransactionError::Validation(
                "transaction id must not be empty".into(),
            ));
        }
        if self.participants.is_empty() {
            return Err(TransactionError::Validation(
                "a transaction needs at least one participant".into(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(TransactionError::Validation(
                "transaction timeout must be positive".into(),
            ));
        }
        let mut seen = HashSet::new();
        for participant in &self.participants {
            if participant.participant_id.trim().is_empty() {
                return Err(TransactionError::Validation(
                    "participant id must not be empty".into(),
                ));
            }
            if !seen.insert(participant.participant_id.as_str()) {
                return Err(TransactionError::Validation(format!(
                    "participant `{}` appears more than once",
                    participant.participant_id
                )));
            }
        }
        Ok(())
    }

    /// Moves to `next` if the state machine allows it.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::InvalidState` for an illegal transition.
    pub fn transition_to(
        &mut self,
        next: TransactionState,
        now: DateTime<Utc>,
    ) -> Result<(), TransactionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransactionError::InvalidState {
                transaction_id: self.transaction_id.clone(),
                state: self.state,
                operation: "transition",
            });
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }
}
