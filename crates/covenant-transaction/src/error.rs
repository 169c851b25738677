//! Transaction error types.

use std::time::Duration;

use thiserror::Error;

use crate::transaction::TransactionState;

/// Errors raised by the coordinator and its store.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransactionError {
    /// No transaction with this id is known.
    #[error("transaction not found: {0}")]
    NotFound(String),

    /// The operation is not allowed in the transaction's current state.
    #[error("cannot {operation} transaction {transaction_id} in state {state}")]
    InvalidState {
        /// The transaction the operation targeted.
        transaction_id: String,
        /// The state it was in.
        state: TransactionState,
        /// The rejected operation.
        operation: &'static str,
    },

    /// The transaction definition is malformed.
    #[error("invalid transaction: {0}")]
    Validation(String),

    /// The transaction store failed.
    #[error("transaction store error: {0}")]
    Store(String),
}

/// A participant call that did not produce a vote.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParticipantError {
    /// The participant could not be reached or answered with an error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The call did not return before its deadline.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
}
