//! In-memory implementation of the `EventStore` trait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use covenant_core::error::DomainError;
use covenant_core::event::{StoredEvent, UncommittedEvent};
use covenant_core::store::{EventStore, Snapshot};

/// Per-aggregate stream. The stream version is the number of events.
#[derive(Debug, Default)]
struct EventStream {
    aggregate_type: Option<String>,
    events: Vec<StoredEvent>,
}

impl EventStream {
    fn version(&self) -> u64 {
        self.events.len() as u64
    }
}

/// Event store that keeps every stream in process memory.
///
/// Appends to one aggregate are serialized by that stream's mutex; appends to
/// different aggregates proceed independently. No lock is held across an
/// `.await`.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<String, Arc<Mutex<EventStream>>>>,
    by_type: RwLock<HashMap<String, Vec<StoredEvent>>>,
    snapshots: RwLock<HashMap<String, Snapshot>>,
}

fn poisoned<T>(_: PoisonError<T>) -> DomainError {
    DomainError::EventSourcing("in-memory event store lock poisoned".into())
}

impl InMemoryEventStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn stream(&self, aggregate_id: &str) -> Result<Option<Arc<Mutex<EventStream>>>, DomainError> {
        Ok(self
            .streams
            .read()
            .map_err(poisoned)?
            .get(aggregate_id)
            .cloned())
    }

    fn stream_or_create(&self, aggregate_id: &str) -> Result<Arc<Mutex<EventStream>>, DomainError> {
        if let Some(stream) = self.stream(aggregate_id)? {
            return Ok(stream);
        }
        let mut streams = self.streams.write().map_err(poisoned)?;
        Ok(Arc::clone(
            streams.entry(aggregate_id.to_owned()).or_default(),
        ))
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append_events(
        &self,
        aggregate_id: &str,
        events: Vec<UncommittedEvent>,
        expected_version: u64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let stream = self.stream_or_create(aggregate_id)?;
        let mut stream = stream.lock().map_err(poisoned)?;

        let actual = stream.version();
        if actual != expected_version {
            return Err(DomainError::ConcurrencyConflict {
                aggregate_id: aggregate_id.to_owned(),
                expected: expected_version,
                actual,
            });
        }

        let Some(first) = events.first() else {
            return Ok(Vec::new());
        };
        let aggregate_type = stream
            .aggregate_type
            .clone()
            .unwrap_or_else(|| first.aggregate_type.clone());
        if let Some(foreign) = events.iter().find(|e| e.aggregate_type != aggregate_type) {
            return Err(DomainError::Validation(format!(
                "event {} has aggregate type `{}` but stream {aggregate_id} holds `{aggregate_type}`",
                foreign.event_id, foreign.aggregate_type
            )));
        }

        let stored: Vec<StoredEvent> = events
            .into_iter()
            .zip(actual + 1..)
            .map(|(event, version)| StoredEvent::from_uncommitted(aggregate_id, version, event))
            .collect();

        {
            let mut by_type = self.by_type.write().map_err(poisoned)?;
            for event in &stored {
                by_type
                    .entry(event.event_type.clone())
                    .or_default()
                    .push(event.clone());
            }
        }
        stream.aggregate_type = Some(aggregate_type);
        stream.events.extend(stored.iter().cloned());

        debug!(
            aggregate_id,
            appended = stored.len(),
            version = stream.version(),
            "events appended"
        );
        Ok(stored)
    }

    async fn get_events(
        &self,
        aggregate_id: &str,
        from_version: u64,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let Some(stream) = self.stream(aggregate_id)? else {
            return Ok(Vec::new());
        };
        let stream = stream.lock().map_err(poisoned)?;
        Ok(stream
            .events
            .iter()
            .filter(|e| e.version > from_version)
            .cloned()
            .collect())
    }

    async fn get_events_by_type(
        &self,
        event_type: &str,
        from_timestamp: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let by_type = self.by_type.read().map_err(poisoned)?;
        Ok(by_type
            .get(event_type)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| from_timestamp.is_none_or(|from| e.timestamp >= from))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), DomainError> {
        let (stream_version, stream_type) = match self.stream(&snapshot.aggregate_id)? {
            Some(stream) => {
                let stream = stream.lock().map_err(poisoned)?;
                (stream.version(), stream.aggregate_type.clone())
            }
            None => (0, None),
        };
        if snapshot.version > stream_version {
            return Err(DomainError::Validation(format!(
                "snapshot of {} at version {} is ahead of its stream (version {stream_version})",
                snapshot.aggregate_id, snapshot.version
            )));
        }
        if let Some(stream_type) = stream_type.filter(|t| *t != snapshot.aggregate_type) {
            return Err(DomainError::Validation(format!(
                "snapshot of {} has aggregate type `{}` but stream holds `{stream_type}`",
                snapshot.aggregate_id, snapshot.aggregate_type
            )));
        }

        let mut snapshots = self.snapshots.write().map_err(poisoned)?;
        match snapshots.get(&snapshot.aggregate_id) {
            Some(existing) if existing.version > snapshot.version => {
                debug!(
                    aggregate_id = %snapshot.aggregate_id,
                    kept = existing.version,
                    offered = snapshot.version,
                    "ignoring older snapshot"
                );
            }
            _ => {
                snapshots.insert(snapshot.aggregate_id.clone(), snapshot);
            }
        }
        Ok(())
    }

    async fn get_snapshot(&self, aggregate_id: &str) -> Result<Option<Snapshot>, DomainError> {
        Ok(self
            .snapshots
            .read()
            .map_err(poisoned)?
            .get(aggregate_id)
            .cloned())
    }

    async fn stream_version(&self, aggregate_id: &str) -> Result<u64, DomainError> {
        match self.stream(aggregate_id)? {
            Some(stream) => Ok(stream.lock().map_err(poisoned)?.version()),
            None => Ok(0),
        }
    }
}
