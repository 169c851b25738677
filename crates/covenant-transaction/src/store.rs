//! Transaction persistence.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::error::TransactionError;
use crate::transaction::DistributedTransaction;

/// Stores transaction records. Every state change is saved.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Inserts or replaces `transaction`.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::Store` on backend failure.
    async fn save(&self, transaction: &DistributedTransaction) -> Result<(), TransactionError>;

    /// Inserts `transaction` unless its id is already stored, as one atomic
    /// step. Returns `false` when the id is taken.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::Store` on backend failure.
    async fn insert_new(
        &self,
        transaction: &DistributedTransaction,
    ) -> Result<bool, TransactionError>;

    /// Loads a transaction by id.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::Store` on backend failure.
    async fn load(
        &self,
        transaction_id: &str,
    ) -> Result<Option<DistributedTransaction>, TransactionError>;

    /// Lists every transaction, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::Store` on backend failure.
    async fn list(&self) -> Result<Vec<DistributedTransaction>, TransactionError>;
}

/// Transaction store held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryTransactionStore {
    transactions: RwLock<HashMap<String, DistributedTransaction>>,
}

impl InMemoryTransactionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn save(&self, transaction: &DistributedTransaction) -> Result<(), TransactionError> {
        self.transactions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(transaction.transaction_id.clone(), transaction.clone());
        Ok(())
    }

    async fn insert_new(
        &self,
        transaction: &DistributedTransaction,
    ) -> Result<bool, TransactionError> {
        let mut transactions = self
            .transactions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if transactions.contains_key(&transaction.transaction_id) {
            return Ok(false);
        }
        transactions.insert(transaction.transaction_id.clone(), transaction.clone());
        Ok(true)
    }

    async fn load(
        &self,
        transaction_id: &str,
    ) -> Result<Option<DistributedTransaction>, TransactionError> {
        Ok(self
            .transactions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(transaction_id)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<DistributedTransaction>, TransactionError> {
        let mut transactions: Vec<_> = self
            .transactions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        transactions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.transaction_id.cmp(&b.transaction_id))
        });
        Ok(transactions)
    }
}
