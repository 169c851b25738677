//! Query bus: routes read-only queries to read-model handlers.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use futures::FutureExt;
use tracing::{error, instrument, warn};

use covenant_core::command::{Query, QueryResult};
use covenant_core::error::DomainError;

use crate::command_bus::panic_message;
use crate::handler::QueryHandler;

/// Dispatches queries to exactly one handler per query type.
#[derive(Default)]
pub struct QueryBus {
    handlers: RwLock<HashMap<String, Arc<dyn QueryHandler>>>,
}

impl QueryBus {
    /// Creates a bus with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `query_type`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Dispatch` if the type already has a handler.
    pub fn register(
        &self,
        query_type: impl Into<String>,
        handler: Arc<dyn QueryHandler>,
    ) -> Result<(), DomainError> {
        let query_type = query_type.into();
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&query_type) {
            return Err(DomainError::Dispatch(format!(
                "a handler is already registered for query type `{query_type}`"
            )));
        }
        handlers.insert(query_type, handler);
        Ok(())
    }

    /// Returns `true` if `query_type` has a handler.
    #[must_use]
    pub fn has_handler(&self, query_type: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(query_type)
    }

    /// Validates `query` and awaits its handler.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::QueryValidation` for a malformed query and
    /// `DomainError::Dispatch` when no handler is registered.
    #[instrument(skip(self, query), fields(query_type = %query.query_type, target_id = %query.target_id))]
    pub async fn execute(&self, query: Query) -> Result<QueryResult, DomainError> {
        query.validate()?;
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&query.query_type)
            .cloned()
            .ok_or_else(|| {
                DomainError::Dispatch(format!(
                    "no handler registered for query type `{}`",
                    query.query_type
                ))
            })?;

        match AssertUnwindSafe(handler.handle(query)).catch_unwind().await {
            Ok(Ok(result)) => Ok(QueryResult::succeeded(result)),
            Ok(Err(e)) => {
                warn!(error = %e, "query handler failed");
                Ok(QueryResult::failed(e.to_string()))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(panic = %message, "query handler panicked");
                Ok(QueryResult::failed(format!("handler panicked: {message}")))
            }
        }
    }
}

impl fmt::Debug for QueryBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let mut types: Vec<_> = handlers.keys().collect();
        types.sort();
        f.debug_struct("QueryBus").field("query_types", &types).finish()
    }
}
