//! Projection progress tracking.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use covenant_core::error::DomainError;
use covenant_core::event::StoredEvent;

/// How far a projection has got through the by-type event index.
///
/// Positions are timestamps. Because reads from the index are inclusive of
/// the checkpoint timestamp, the ids of events already applied at exactly
/// that timestamp are kept so they are not applied twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionCheckpoint {
    /// Projection this checkpoint belongs to.
    pub projection_name: String,
    /// Timestamp of the latest applied event.
    pub last_timestamp: Option<DateTime<Utc>>,
    /// Events already applied at `last_timestamp`.
    pub processed_at_last_timestamp: Vec<Uuid>,
    /// Total number of events applied.
    pub events_processed: u64,
    /// Error from the most recent failed batch, cleared by the next clean one.
    pub last_error: Option<String>,
    /// When the checkpoint was last written.
    pub updated_at: DateTime<Utc>,
}

impl ProjectionCheckpoint {
    /// A checkpoint positioned before the first event.
    #[must_use]
    pub fn new(projection_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            projection_name: projection_name.into(),
            last_timestamp: None,
            processed_at_last_timestamp: Vec::new(),
            events_processed: 0,
            last_error: None,
            updated_at: now,
        }
    }

    /// Returns `true` if `event` was applied already.
    #[must_use]
    pub fn has_processed(&self, event: &StoredEvent) -> bool {
        match self.last_timestamp {
            Some(last) if event.timestamp < last => true,
            Some(last) if event.timestamp == last => {
                self.processed_at_last_timestamp.contains(&event.event_id)
            }
            _ => false,
        }
    }

    /// Moves the position past `event`. Events must be recorded in
    /// timestamp order.
    pub fn record(&mut self, event: &StoredEvent) {
        if self.last_timestamp == Some(event.timestamp) {
            self.processed_at_last_timestamp.push(event.event_id);
        } else {
            self.last_timestamp = Some(event.timestamp);
            self.processed_at_last_timestamp = vec![event.event_id];
        }
        self.events_processed += 1;
    }
}

/// Persistence for projection checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Loads the checkpoint of `projection_name`, if any.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::EventSourcing` on backend failure.
    async fn load(&self, projection_name: &str) -> Result<Option<ProjectionCheckpoint>, DomainError>;

    /// Saves `checkpoint`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::EventSourcing` on backend failure.
    async fn save(&self, checkpoint: ProjectionCheckpoint) -> Result<(), DomainError>;

    /// Removes the checkpoint of `projection_name`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::EventSourcing` on backend failure.
    async fn delete(&self, projection_name: &str) -> Result<(), DomainError>;
}

/// Checkpoint store held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, ProjectionCheckpoint>>,
}

impl InMemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, projection_name: &str) -> Result<Option<ProjectionCheckpoint>, DomainError> {
        Ok(self
            .checkpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(projection_name)
            .cloned())
    }

    async fn save(&self, checkpoint: ProjectionCheckpoint) -> Result<(), DomainError> {
        self.checkpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(checkpoint.projection_name.clone(), checkpoint);
        Ok(())
    }

    async fn delete(&self, projection_name: &str) -> Result<(), DomainError> {
        self.checkpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(projection_name);
        Ok(())
    }
}
