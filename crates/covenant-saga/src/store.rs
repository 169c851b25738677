//! Saga persistence.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::SagaError;
use crate::saga::SagaTransaction;

/// Stores saga records. Every state change is saved.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Inserts or replaces `saga`.
    ///
    /// # Errors
    ///
    /// Returns `SagaError::Store` on backend failure.
    async fn save(&self, saga: &SagaTransaction) -> Result<(), SagaError>;

    /// Inserts `saga` unless its id is already stored, as one atomic step.
    /// Returns `false` when the id is taken.
    ///
    /// # Errors
    ///
    /// Returns `SagaError::Store` on backend failure.
    async fn insert_new(&self, saga: &SagaTransaction) -> Result<bool, SagaError>;

    /// Loads a saga by id.
    ///
    /// # Errors
    ///
    /// Returns `SagaError::Store` on backend failure.
    async fn load(&self, saga_id: &str) -> Result<Option<SagaTransaction>, SagaError>;

    /// Lists every saga, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `SagaError::Store` on backend failure.
    async fn list(&self) -> Result<Vec<SagaTransaction>, SagaError>;
}

/// Saga store held in process memory.
#[derive(Debug, Default)]
pub struct InMemorySagaStore {
    sagas: RwLock<HashMap<String, SagaTransaction>>,
}

impl InMemorySagaStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn save(&self, saga: &SagaTransaction) -> Result<(), SagaError> {
        self.sagas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(saga.saga_id.clone(), saga.clone());
        Ok(())
    }

    async fn insert_new(&self, saga: &SagaTransaction) -> Result<bool, SagaError> {
        let mut sagas = self.sagas.write().unwrap_or_else(PoisonError::into_inner);
        if sagas.contains_key(&saga.saga_id) {
            return Ok(false);
        }
        sagas.insert(saga.saga_id.clone(), saga.clone());
        Ok(true)
    }

    async fn load(&self, saga_id: &str) -> Result<Option<SagaTransaction>, SagaError> {
        Ok(self
            .sagas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(saga_id)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<SagaTransaction>, SagaError> {
        let mut sagas: Vec<_> = self
            .sagas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        sagas.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.saga_id.cmp(&b.saga_id))
        });
        Ok(sagas)
    }
}
