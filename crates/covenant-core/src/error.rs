//! Domain error types.

use thiserror::Error;

/// Top-level error type shared by the event store, the aggregate repository
/// and the command/query buses.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An aggregate was not found (no snapshot and no events).
    #[error("aggregate not found: {0}")]
    AggregateNotFound(String),

    /// Optimistic concurrency conflict. The caller must reload and retry.
    #[error(
        "concurrency conflict on aggregate {aggregate_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        /// The aggregate that had the conflict.
        aggregate_id: String,
        /// The version the caller expected.
        expected: u64,
        /// The version actually found in the stream.
        actual: u64,
    },

    /// A validation error in domain logic or store input.
    #[error("validation error: {0}")]
    Validation(String),

    /// A command was malformed. Never retried.
    #[error("invalid command: {0}")]
    CommandValidation(String),

    /// A query was malformed. Never retried.
    #[error("invalid query: {0}")]
    QueryValidation(String),

    /// Dispatch configuration error (missing or duplicate handler).
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// An event type has no registered decoder for the aggregate type.
    #[error("unknown event type `{event_type}` for aggregate type `{aggregate_type}`")]
    UnknownEventType {
        /// The aggregate type being reconstituted.
        aggregate_type: String,
        /// The unrecognised event type.
        event_type: String,
    },

    /// Event payload or snapshot (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic event store failure.
    #[error("event store error: {0}")]
    EventSourcing(String),
}

impl DomainError {
    /// Returns `true` when the caller may reload state and try again.
    #[must_use]
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_conflict_message_names_versions() {
        let err = DomainError::ConcurrencyConflict {
            aggregate_id: "order-1".into(),
            expected: 2,
            actual: 3,
        };

        assert_eq!(
            err.to_string(),
            "concurrency conflict on aggregate order-1: expected version 2, found 3"
        );
        assert!(err.is_concurrency_conflict());
    }

    #[test]
    fn test_validation_is_not_a_concurrency_conflict() {
        assert!(!DomainError::Validation("bad".into()).is_concurrency_conflict());
    }
}
