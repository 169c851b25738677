//! Snapshot-aware aggregate repository.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::aggregate::{AggregateRoot, EventRegistry, registry_for};
use crate::clock::Clock;
use crate::error::DomainError;
use crate::event::StoredEvent;
use crate::store::{EventStore, Snapshot};

/// Loads and saves aggregates of type `A` through an [`EventStore`].
///
/// Aggregates are rebuilt from the latest snapshot plus the events after it.
/// A snapshot is written whenever a save lands the aggregate on a multiple
/// of `snapshot_frequency` (0 disables snapshots).
pub struct AggregateRepository<A: AggregateRoot> {
    store: Arc<dyn EventStore>,
    registry: EventRegistry<A::Event>,
    snapshot_frequency: u64,
    clock: Arc<dyn Clock>,
}

impl<A> AggregateRepository<A>
where
    A: AggregateRoot,
    A::Event: 'static,
{
    /// Creates a repository and builds the event decoder registry for `A`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Dispatch` if `A` registers an event type twice.
    pub fn new(
        store: Arc<dyn EventStore>,
        snapshot_frequency: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DomainError> {
        Ok(Self {
            store,
            registry: registry_for::<A>()?,
            snapshot_frequency,
            clock,
        })
    }

    /// Returns the configured snapshot frequency.
    #[must_use]
    pub fn snapshot_frequency(&self) -> u64 {
        self.snapshot_frequency
    }

    /// Reconstitutes an aggregate from its latest snapshot and later events.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::AggregateNotFound` if there is neither a snapshot
    /// nor any event, `DomainError::UnknownEventType` if the history contains
    /// an unregistered event type, and store errors unchanged.
    #[instrument(skip(self), fields(aggregate_type = A::AGGREGATE_TYPE))]
    pub async fn get_by_id(&self, aggregate_id: &str) -> Result<A, DomainError> {
        let snapshot = self.store.get_snapshot(aggregate_id).await?;

        let (mut aggregate, from_version) = match snapshot {
            Some(snapshot) => {
                if snapshot.aggregate_type != A::AGGREGATE_TYPE {
                    return Err(DomainError::Validation(format!(
                        "snapshot of {aggregate_id} has aggregate type `{}`, expected `{}`",
                        snapshot.aggregate_type,
                        A::AGGREGATE_TYPE
                    )));
                }
                debug!(version = snapshot.version, "restoring from snapshot");
                (
                    A::restore(aggregate_id, snapshot.version, &snapshot.data)?,
                    Some(snapshot.version),
                )
            }
            None => (A::new(aggregate_id), None),
        };

        let events = self
            .store
            .get_events(aggregate_id, from_version.unwrap_or(0))
            .await?;

        if from_version.is_none() && events.is_empty() {
            return Err(DomainError::AggregateNotFound(aggregate_id.to_owned()));
        }

        for stored in &events {
            let expected = aggregate.version() + 1;
            if stored.version != expected {
                return Err(DomainError::EventSourcing(format!(
                    "stream {aggregate_id} is not contiguous: expected version {expected}, found {}",
                    stored.version
                )));
            }
            let event = self.registry.decode(stored)?;
            aggregate.apply(&event);
        }

        debug!(
            version = aggregate.version(),
            replayed = events.len(),
            "aggregate loaded"
        );
        Ok(aggregate)
    }

    /// Returns `true` if the aggregate has a snapshot or at least one event.
    ///
    /// # Errors
    ///
    /// Returns store errors unchanged.
    pub async fn exists(&self, aggregate_id: &str) -> Result<bool, DomainError> {
        if self.store.stream_version(aggregate_id).await? > 0 {
            return Ok(true);
        }
        Ok(self.store.get_snapshot(aggregate_id).await?.is_some())
    }

    /// Persists the aggregate's uncommitted events, clears them and returns
    /// the stored events.
    ///
    /// The expected stream version is the aggregate version minus the number
    /// of pending events. A failed snapshot write is logged and does not fail
    /// the save.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::UnknownEventType` if a pending event has no
    /// registered decoder, `DomainError::ConcurrencyConflict` if the stream
    /// moved since the aggregate was loaded, and store errors unchanged. The
    /// pending events are kept on error.
    #[instrument(skip(self, aggregate), fields(aggregate_type = A::AGGREGATE_TYPE, aggregate_id = %aggregate.aggregate_id()))]
    pub async fn save(&self, aggregate: &mut A) -> Result<Vec<StoredEvent>, DomainError> {
        let pending = aggregate.uncommitted_events();
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(unknown) = pending
            .iter()
            .find(|event| !self.registry.contains(&event.event_type))
        {
            return Err(DomainError::UnknownEventType {
                aggregate_type: A::AGGREGATE_TYPE.to_owned(),
                event_type: unknown.event_type.clone(),
            });
        }

        let count = pending.len() as u64;
        let expected_version = aggregate.version().checked_sub(count).ok_or_else(|| {
            DomainError::EventSourcing(format!(
                "aggregate {} has {count} pending events but version {}",
                aggregate.aggregate_id(),
                aggregate.version()
            ))
        })?;

        let stored = self
            .store
            .append_events(aggregate.aggregate_id(), pending.to_vec(), expected_version)
            .await?;
        aggregate.clear_uncommitted_events();

        debug!(
            appended = stored.len(),
            version = aggregate.version(),
            "events appended"
        );

        if self.snapshot_frequency > 0 && aggregate.version() % self.snapshot_frequency == 0 {
            self.take_snapshot(aggregate).await;
        }

        Ok(stored)
    }

    async fn take_snapshot(&self, aggregate: &A) {
        let data = match aggregate.snapshot_state() {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "failed to serialize snapshot state");
                return;
            }
        };
        let snapshot = Snapshot {
            aggregate_id: aggregate.aggregate_id().to_owned(),
            aggregate_type: A::AGGREGATE_TYPE.to_owned(),
            version: aggregate.version(),
            data,
            timestamp: self.clock.now(),
        };
        match self.store.save_snapshot(snapshot).await {
            Ok(()) => debug!(version = aggregate.version(), "snapshot saved"),
            Err(e) => warn!(error = %e, "failed to save snapshot"),
        }
    }
}

impl<A: AggregateRoot> fmt::Debug for AggregateRepository<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateRepository")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("snapshot_frequency", &self.snapshot_frequency)
            .finish_non_exhaustive()
    }
}
