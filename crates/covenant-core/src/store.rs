//! Event store abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DomainError;
use crate::event::{StoredEvent, UncommittedEvent};

/// Point-in-time serialization of aggregate state at a specific version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Aggregate this snapshot belongs to.
    pub aggregate_id: String,
    /// Type of the aggregate.
    pub aggregate_type: String,
    /// Stream version the state corresponds to.
    pub version: u64,
    /// Serialized aggregate state.
    pub data: Value,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
}

/// Append-only, per-aggregate event log with optimistic concurrency and
/// snapshotting.
///
/// Implementations must make `append_events` atomic with respect to
/// concurrent callers on the same aggregate and must never retry on their
/// own: a version mismatch is reported to the caller unchanged.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends `events` to the aggregate stream iff the stream is currently
    /// at `expected_version`. Versions `expected_version + 1 ..` are assigned
    /// to the batch in order.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::ConcurrencyConflict` on a version mismatch (the
    /// stream is left unchanged), `DomainError::Validation` if the batch does
    /// not match the stream's aggregate type, and `DomainError::EventSourcing`
    /// on backend failure.
    async fn append_events(
        &self,
        aggregate_id: &str,
        events: Vec<UncommittedEvent>,
        expected_version: u64,
    ) -> Result<Vec<StoredEvent>, DomainError>;

    /// Loads all events with `version > from_version`, ordered by version.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::EventSourcing` on backend failure.
    async fn get_events(
        &self,
        aggregate_id: &str,
        from_version: u64,
    ) -> Result<Vec<StoredEvent>, DomainError>;

    /// Loads events of one type across aggregates with
    /// `timestamp >= from_timestamp`. Ordering is only guaranteed within a
    /// single aggregate.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::EventSourcing` on backend failure.
    async fn get_events_by_type(
        &self,
        event_type: &str,
        from_timestamp: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredEvent>, DomainError>;

    /// Stores `snapshot` as the latest snapshot of its aggregate.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the snapshot is ahead of its
    /// stream, `DomainError::EventSourcing` on backend failure.
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), DomainError>;

    /// Returns the latest snapshot of the aggregate, if any.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::EventSourcing` on backend failure.
    async fn get_snapshot(&self, aggregate_id: &str) -> Result<Option<Snapshot>, DomainError>;

    /// Returns the current stream version (0 for an unknown aggregate).
    ///
    /// # Errors
    ///
    /// Returns `DomainError::EventSourcing` on backend failure.
    async fn stream_version(&self, aggregate_id: &str) -> Result<u64, DomainError>;
}
