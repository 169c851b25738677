//! Domain event abstractions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::DomainError;

/// Trait implemented by each aggregate's event union.
pub trait DomainEvent: Send + Sync + std::fmt::Debug {
    /// Returns the event type name (used as the decoder key on replay).
    fn event_type(&self) -> &'static str;

    /// Serializes the variant's payload (without the type tag) to JSON.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if the payload cannot be encoded.
    fn to_payload(&self) -> Result<Value, DomainError>;
}

/// Causal context stamped onto every event raised while handling a command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventContext {
    /// Correlation ID for tracing a command through its effects.
    pub correlation_id: Option<Uuid>,
    /// The command or event that caused the new event.
    pub causation_id: Option<Uuid>,
    /// Free-form metadata copied onto the event.
    pub metadata: Map<String, Value>,
}

impl EventContext {
    /// Context for events caused directly by a command.
    #[must_use]
    pub fn caused_by(command_id: Uuid, correlation_id: Uuid) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            causation_id: Some(command_id),
            metadata: Map::new(),
        }
    }
}

/// An event raised by an aggregate that has not been appended yet.
///
/// The store assigns the aggregate stream and version at append time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Type name for decoder routing.
    pub event_type: String,
    /// Type of the aggregate that raised the event.
    pub aggregate_type: String,
    /// Serialized event payload.
    pub data: Value,
    /// Free-form metadata.
    pub metadata: Map<String, Value>,
    /// Business time of the event.
    pub timestamp: DateTime<Utc>,
    /// Correlation ID for tracing.
    pub correlation_id: Option<Uuid>,
    /// Causation ID linking to the causing command/event.
    pub causation_id: Option<Uuid>,
}

impl UncommittedEvent {
    /// Creates an uncommitted event with a fresh event id and no context.
    #[must_use]
    pub fn new(
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        data: Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            aggregate_type: aggregate_type.into(),
            data,
            metadata: Map::new(),
            timestamp,
            correlation_id: None,
            causation_id: None,
        }
    }

    /// Builds the uncommitted form of a typed domain event.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if the payload cannot be encoded.
    pub fn from_domain_event<E: DomainEvent>(
        aggregate_type: &str,
        event: &E,
        context: &EventContext,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        Ok(Self::new(aggregate_type, event.event_type(), event.to_payload()?, timestamp)
            .with_context(context))
    }

    /// Copies correlation, causation and metadata from `context`.
    #[must_use]
    pub fn with_context(mut self, context: &EventContext) -> Self {
        self.correlation_id = context.correlation_id;
        self.causation_id = context.causation_id;
        self.metadata.extend(context.metadata.clone());
        self
    }
}

/// An event as persisted in an aggregate stream. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Type name for decoder routing.
    pub event_type: String,
    /// Aggregate/stream this event belongs to.
    pub aggregate_id: String,
    /// Type of the owning aggregate.
    pub aggregate_type: String,
    /// Position within the aggregate stream, starting at 1.
    pub version: u64,
    /// Serialized event payload.
    pub data: Value,
    /// Free-form metadata.
    pub metadata: Map<String, Value>,
    /// Business time of the event.
    pub timestamp: DateTime<Utc>,
    /// Correlation ID for tracing.
    pub correlation_id: Option<Uuid>,
    /// Causation ID linking to the causing command/event.
    pub causation_id: Option<Uuid>,
}

impl StoredEvent {
    /// Stamps an uncommitted event with its stream and version.
    #[must_use]
    pub fn from_uncommitted(aggregate_id: &str, version: u64, event: UncommittedEvent) -> Self {
        Self {
            event_id: event.event_id,
            event_type: event.event_type,
            aggregate_id: aggregate_id.to_owned(),
            aggregate_type: event.aggregate_type,
            version,
            data: event.data,
            metadata: event.metadata,
            timestamp: event.timestamp,
            correlation_id: event.correlation_id,
            causation_id: event.causation_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_with_context_copies_correlation_and_metadata() {
        // Arrange
        let command_id = Uuid::new_v4();
        let correlation_id = Uuid::new_v4();
        let mut context = EventContext::caused_by(command_id, correlation_id);
        context
            .metadata
            .insert("tenant".into(), Value::String("acme".into()));
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();

        // Act
        let event = UncommittedEvent::new("order", "order.placed", serde_json::json!({}), now)
            .with_context(&context);

        // Assert
        assert_eq!(event.correlation_id, Some(correlation_id));
        assert_eq!(event.causation_id, Some(command_id));
        assert_eq!(event.metadata["tenant"], "acme");
        assert_eq!(event.timestamp, now);
    }

    #[test]
    fn test_from_uncommitted_assigns_stream_and_version() {
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();
        let pending = UncommittedEvent::new("order", "order.placed", serde_json::json!({"a": 1}), now);
        let event_id = pending.event_id;

        let stored = StoredEvent::from_uncommitted("order-1", 3, pending);

        assert_eq!(stored.event_id, event_id);
        assert_eq!(stored.aggregate_id, "order-1");
        assert_eq!(stored.version, 3);
        assert_eq!(stored.data["a"], 1);
    }
}
