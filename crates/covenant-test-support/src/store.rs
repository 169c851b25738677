//! `EventStore` doubles: recording, empty and failing stores.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use covenant_core::error::DomainError;
use covenant_core::event::{StoredEvent, UncommittedEvent};
use covenant_core::store::{EventStore, Snapshot};

/// An appended batch as seen by `RecordingEventStore`.
pub type AppendedBatch = (String, u64, Vec<UncommittedEvent>);

fn stamp(aggregate_id: &str, events: Vec<UncommittedEvent>, expected: u64) -> Vec<StoredEvent> {
    events
        .into_iter()
        .zip(expected + 1..)
        .map(|(event, version)| StoredEvent::from_uncommitted(aggregate_id, version, event))
        .collect()
}

/// An event store that serves a fixed history and records every append and
/// snapshot write. Appends always succeed and never check the version.
#[derive(Debug)]
pub struct RecordingEventStore {
    history: Vec<StoredEvent>,
    snapshot: Option<Snapshot>,
    fail_snapshot_writes: bool,
    appended: Mutex<Vec<AppendedBatch>>,
    snapshots_saved: Mutex<Vec<Snapshot>>,
}

impl RecordingEventStore {
    /// Create a recording store that returns `history` from `get_events`.
    #[must_use]
    pub fn new(history: Vec<StoredEvent>) -> Self {
        Self {
            history,
            snapshot: None,
            fail_snapshot_writes: false,
            appended: Mutex::new(Vec::new()),
            snapshots_saved: Mutex::new(Vec::new()),
        }
    }

    /// Serve `snapshot` from `get_snapshot`.
    #[must_use]
    pub fn with_snapshot(mut self, snapshot: Snapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// Make every `save_snapshot` call fail.
    #[must_use]
    pub fn failing_snapshot_writes(mut self) -> Self {
        self.fail_snapshot_writes = true;
        self
    }

    /// Returns all batches that were appended.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn appended_events(&self) -> Vec<AppendedBatch> {
        self.appended.lock().unwrap().clone()
    }

    /// Returns all snapshots that were written successfully.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn saved_snapshots(&self) -> Vec<Snapshot> {
        self.snapshots_saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventStore for RecordingEventStore {
    async fn append_events(
        &self,
        aggregate_id: &str,
        events: Vec<UncommittedEvent>,
        expected_version: u64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        self.appended.lock().unwrap().push((
            aggregate_id.to_owned(),
            expected_version,
            events.clone(),
        ));
        Ok(stamp(aggregate_id, events, expected_version))
    }

    async fn get_events(
        &self,
        aggregate_id: &str,
        from_version: u64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Ok(self
            .history
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id && e.version > from_version)
            .cloned()
            .collect())
    }

    async fn get_events_by_type(
        &self,
        event_type: &str,
        from_timestamp: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Ok(self
            .history
            .iter()
            .filter(|e| e.event_type == event_type)
            .filter(|e| from_timestamp.is_none_or(|from| e.timestamp >= from))
            .cloned()
            .collect())
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), DomainError> {
        if self.fail_snapshot_writes {
            return Err(DomainError::EventSourcing("snapshot table unavailable".into()));
        }
        self.snapshots_saved.lock().unwrap().push(snapshot);
        Ok(())
    }

    async fn get_snapshot(&self, aggregate_id: &str) -> Result<Option<Snapshot>, DomainError> {
        Ok(self
            .snapshot
            .clone()
            .filter(|s| s.aggregate_id == aggregate_id))
    }

    async fn stream_version(&self, aggregate_id: &str) -> Result<u64, DomainError> {
        Ok(self
            .history
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .map(|e| e.version)
            .max()
            .unwrap_or(0))
    }
}

/// An event store that holds nothing and silently accepts appends. Useful
/// for "aggregate not found" scenarios and creation commands.
#[derive(Debug)]
pub struct EmptyEventStore;

#[async_trait]
impl EventStore for EmptyEventStore {
    async fn append_events(
        &self,
        aggregate_id: &str,
        events: Vec<UncommittedEvent>,
        expected_version: u64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Ok(stamp(aggregate_id, events, expected_version))
    }

    async fn get_events(
        &self,
        _aggregate_id: &str,
        _from_version: u64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Ok(vec![])
    }

    async fn get_events_by_type(
        &self,
        _event_type: &str,
        _from_timestamp: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Ok(vec![])
    }

    async fn save_snapshot(&self, _snapshot: Snapshot) -> Result<(), DomainError> {
        Ok(())
    }

    async fn get_snapshot(&self, _aggregate_id: &str) -> Result<Option<Snapshot>, DomainError> {
        Ok(None)
    }

    async fn stream_version(&self, _aggregate_id: &str) -> Result<u64, DomainError> {
        Ok(0)
    }
}

/// An event store that always returns a backend error. Useful for testing
/// error-handling paths.
#[derive(Debug)]
pub struct FailingEventStore;

fn connection_refused() -> DomainError {
    DomainError::EventSourcing("connection refused".into())
}

#[async_trait]
impl EventStore for FailingEventStore {
    async fn append_events(
        &self,
        _aggregate_id: &str,
        _events: Vec<UncommittedEvent>,
        _expected_version: u64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Err(connection_refused())
    }

    async fn get_events(
        &self,
        _aggregate_id: &str,
        _from_version: u64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Err(connection_refused())
    }

    async fn get_events_by_type(
        &self,
        _event_type: &str,
        _from_timestamp: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Err(connection_refused())
    }

    async fn save_snapshot(&self, _snapshot: Snapshot) -> Result<(), DomainError> {
        Err(connection_refused())
    }

    async fn get_snapshot(&self, _aggregate_id: &str) -> Result<Option<Snapshot>, DomainError> {
        Err(connection_refused())
    }

    async fn stream_version(&self, _aggregate_id: &str) -> Result<u64, DomainError> {
        Err(connection_refused())
    }
}
