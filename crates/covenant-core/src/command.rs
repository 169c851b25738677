//! Command and query dispatch objects.
//!
//! Commands and queries are transient: they are routed by type to a single
//! handler and never persisted.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::DomainError;
use crate::event::EventContext;

/// A request to change the state of one aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Unique command identifier (becomes the causation id of its events).
    pub id: Uuid,
    /// Routing key for the command bus.
    pub command_type: String,
    /// Aggregate (or external resource) the command targets.
    pub target_id: String,
    /// Command-specific payload.
    pub payload: Value,
    /// Optional optimistic concurrency expectation.
    pub expected_version: Option<u64>,
    /// Correlation ID for tracing a command through its effects.
    pub correlation_id: Uuid,
    /// Free-form metadata (saga id, step id, saga context, ...).
    pub metadata: Map<String, Value>,
}

impl Command {
    /// Creates a command that starts its own correlation chain.
    #[must_use]
    pub fn new(command_type: impl Into<String>, target_id: impl Into<String>, payload: Value) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            command_type: command_type.into(),
            target_id: target_id.into(),
            payload,
            expected_version: None,
            correlation_id: id,
            metadata: Map::new(),
        }
    }

    /// Sets the optimistic concurrency expectation.
    #[must_use]
    pub fn with_expected_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    /// Joins an existing correlation chain.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Checks the routing fields.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::CommandValidation` if the type or target is blank.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.command_type.trim().is_empty() {
            return Err(DomainError::CommandValidation(
                "command type must not be empty".into(),
            ));
        }
        if self.target_id.trim().is_empty() {
            return Err(DomainError::CommandValidation(format!(
                "command `{}` has an empty target id",
                self.command_type
            )));
        }
        Ok(())
    }

    /// Deserializes the payload into a typed request.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::CommandValidation` if the payload does not match.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, DomainError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            DomainError::CommandValidation(format!(
                "invalid payload for `{}`: {e}",
                self.command_type
            ))
        })
    }

    /// Event context for events raised while handling this command.
    #[must_use]
    pub fn event_context(&self) -> EventContext {
        let mut context = EventContext::caused_by(self.id, self.correlation_id);
        context.metadata.clone_from(&self.metadata);
        context
    }
}

/// A read-only request against a read model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Unique query identifier.
    pub id: Uuid,
    /// Routing key for the query bus.
    pub query_type: String,
    /// Read-model entry the query targets.
    pub target_id: String,
    /// Query-specific parameters.
    pub payload: Value,
    /// Minimum read-model version the caller expects to observe.
    pub expected_version: Option<u64>,
}

impl Query {
    /// Creates a query.
    #[must_use]
    pub fn new(query_type: impl Into<String>, target_id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            query_type: query_type.into(),
            target_id: target_id.into(),
            payload,
            expected_version: None,
        }
    }

    /// Requires the read model to have caught up to `version`.
    #[must_use]
    pub fn with_expected_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    /// Checks the routing fields.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::QueryValidation` if the query type is blank.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.query_type.trim().is_empty() {
            return Err(DomainError::QueryValidation(
                "query type must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Deserializes the payload into typed parameters.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::QueryValidation` if the payload does not match.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, DomainError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            DomainError::QueryValidation(format!("invalid payload for `{}`: {e}", self.query_type))
        })
    }
}

/// Outcome of executing a command. Handler failures are reported here
/// rather than propagated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Whether the handler succeeded.
    pub success: bool,
    /// Handler output on success.
    pub result: Option<Value>,
    /// Error message on failure.
    pub error: Option<String>,
}

impl CommandResult {
    /// A successful result.
    #[must_use]
    pub fn succeeded(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// A failed result.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Outcome of executing a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Whether the handler succeeded.
    pub success: bool,
    /// Handler output on success.
    pub result: Option<Value>,
    /// Error message on failure.
    pub error: Option<String>,
}

impl QueryResult {
    /// A successful result.
    #[must_use]
    pub fn succeeded(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// A failed result.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}
