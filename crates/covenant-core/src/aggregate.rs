//! Aggregate root abstraction and the event decoder registry.

use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::clock::Clock;
use crate::error::DomainError;
use crate::event::{DomainEvent, EventContext, StoredEvent, UncommittedEvent};

type Decoder<E> = Box<dyn Fn(&Value) -> Result<E, serde_json::Error> + Send + Sync>;

/// Type-keyed table mapping a stored `event_type` to the variant of the
/// aggregate's event union it decodes into.
///
/// Registration is checked eagerly: a duplicate event type is a
/// configuration error, and decoding an unregistered type fails instead of
/// being skipped.
pub struct EventRegistry<E> {
    aggregate_type: &'static str,
    decoders: HashMap<&'static str, Decoder<E>>,
}

impl<E: 'static> EventRegistry<E> {
    /// Creates an empty registry for `aggregate_type`.
    #[must_use]
    pub fn new(aggregate_type: &'static str) -> Self {
        Self {
            aggregate_type,
            decoders: HashMap::new(),
        }
    }

    /// Registers `variant` as the constructor for `event_type` payloads.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Dispatch` if `event_type` is already registered.
    pub fn register<P>(
        &mut self,
        event_type: &'static str,
        variant: fn(P) -> E,
    ) -> Result<&mut Self, DomainError>
    where
        P: DeserializeOwned + 'static,
    {
        if self.decoders.contains_key(event_type) {
            return Err(DomainError::Dispatch(format!(
                "event type `{event_type}` registered twice for aggregate type `{}`",
                self.aggregate_type
            )));
        }
        self.decoders.insert(
            event_type,
            Box::new(move |data| serde_json::from_value::<P>(data.clone()).map(variant)),
        );
        Ok(self)
    }

    /// Returns `true` if `event_type` has a decoder.
    #[must_use]
    pub fn contains(&self, event_type: &str) -> bool {
        self.decoders.contains_key(event_type)
    }

    /// Registered event types, in no particular order.
    pub fn event_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.decoders.keys().copied()
    }

    /// Decodes a stored event into the aggregate's event union.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if the event belongs to another
    /// aggregate type, `DomainError::UnknownEventType` if no decoder is
    /// registered, and `DomainError::Serialization` if the payload is invalid.
    pub fn decode(&self, stored: &StoredEvent) -> Result<E, DomainError> {
        if stored.aggregate_type != self.aggregate_type {
            return Err(DomainError::Validation(format!(
                "event {} belongs to aggregate type `{}`, expected `{}`",
                stored.event_id, stored.aggregate_type, self.aggregate_type
            )));
        }
        let decoder = self.decoders.get(stored.event_type.as_str()).ok_or_else(|| {
            DomainError::UnknownEventType {
                aggregate_type: self.aggregate_type.to_owned(),
                event_type: stored.event_type.clone(),
            }
        })?;
        Ok(decoder(&stored.data)?)
    }
}

impl<E> fmt::Debug for EventRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.decoders.keys().collect();
        types.sort();
        f.debug_struct("EventRegistry")
            .field("aggregate_type", &self.aggregate_type)
            .field("event_types", &types)
            .finish()
    }
}

/// Trait for aggregate roots that reconstitute from event history.
pub trait AggregateRoot: Send + Sync + Sized {
    /// The event union this aggregate produces and consumes.
    type Event: DomainEvent;

    /// Stable aggregate type name stored alongside every event.
    const AGGREGATE_TYPE: &'static str;

    /// Creates an empty aggregate at version 0.
    fn new(aggregate_id: &str) -> Self;

    /// Returns the aggregate identifier.
    fn aggregate_id(&self) -> &str;

    /// Returns the current version, including uncommitted events.
    fn version(&self) -> u64;

    /// Applies an event to mutate internal state. Must advance the version
    /// by exactly one.
    fn apply(&mut self, event: &Self::Event);

    /// Returns uncommitted events produced by command handling.
    fn uncommitted_events(&self) -> &[UncommittedEvent];

    /// Buffers a newly raised event.
    fn push_uncommitted(&mut self, event: UncommittedEvent);

    /// Clears uncommitted events after persistence.
    fn clear_uncommitted_events(&mut self);

    /// Registers a decoder for every event type this aggregate understands.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Dispatch` on duplicate registration.
    fn register_events(registry: &mut EventRegistry<Self::Event>) -> Result<(), DomainError>;

    /// Serializes the current state for a snapshot.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if the state cannot be encoded.
    fn snapshot_state(&self) -> Result<Value, DomainError>;

    /// Rebuilds an aggregate from snapshot state taken at `version`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if the state cannot be decoded.
    fn restore(aggregate_id: &str, version: u64, state: &Value) -> Result<Self, DomainError>;

    /// Applies `event` and records it for persistence.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if the payload cannot be encoded.
    fn raise(
        &mut self,
        event: Self::Event,
        context: &EventContext,
        clock: &dyn Clock,
    ) -> Result<(), DomainError> {
        let pending =
            UncommittedEvent::from_domain_event(Self::AGGREGATE_TYPE, &event, context, clock.now())?;
        self.apply(&event);
        self.push_uncommitted(pending);
        Ok(())
    }
}

/// Builds the decoder registry for `A`.
///
/// # Errors
///
/// Returns `DomainError::Dispatch` if `A` registers an event type twice.
pub fn registry_for<A: AggregateRoot>() -> Result<EventRegistry<A::Event>, DomainError>
where
    A::Event: 'static,
{
    let mut registry = EventRegistry::new(A::AGGREGATE_TYPE);
    A::register_events(&mut registry)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::clock::SystemClock;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Incremented {
        by: i64,
    }

    #[derive(Debug, Clone)]
    enum CounterEvent {
        Incremented(Incremented),
    }

    impl DomainEvent for CounterEvent {
        fn event_type(&self) -> &'static str {
            match self {
                Self::Incremented(_) => "counter.incremented",
            }
        }

        fn to_payload(&self) -> Result<Value, DomainError> {
            match self {
                Self::Incremented(p) => Ok(serde_json::to_value(p)?),
            }
        }
    }

    #[derive(Debug)]
    struct Counter {
        id: String,
        version: u64,
        total: i64,
        uncommitted: Vec<UncommittedEvent>,
    }

    impl AggregateRoot for Counter {
        type Event = CounterEvent;
        const AGGREGATE_TYPE: &'static str = "counter";

        fn new(aggregate_id: &str) -> Self {
            Self {
                id: aggregate_id.to_owned(),
                version: 0,
                total: 0,
                uncommitted: Vec::new(),
            }
        }

        fn aggregate_id(&self) -> &str {
            &self.id
        }

        fn version(&self) -> u64 {
            self.version
        }

        fn apply(&mut self, event: &CounterEvent) {
            match event {
                CounterEvent::Incremented(p) => self.total += p.by,
            }
            self.version += 1;
        }

        fn uncommitted_events(&self) -> &[UncommittedEvent] {
            &self.uncommitted
        }

        fn push_uncommitted(&mut self, event: UncommittedEvent) {
            self.uncommitted.push(event);
        }

        fn clear_uncommitted_events(&mut self) {
            self.uncommitted.clear();
        }

        fn register_events(registry: &mut EventRegistry<CounterEvent>) -> Result<(), DomainError> {
            registry.register("counter.incremented", CounterEvent::Incremented)?;
            Ok(())
        }

        fn snapshot_state(&self) -> Result<Value, DomainError> {
            Ok(serde_json::json!({ "total": self.total }))
        }

        fn restore(aggregate_id: &str, version: u64, state: &Value) -> Result<Self, DomainError> {
            let mut counter = Self::new(aggregate_id);
            counter.version = version;
            counter.total = state["total"].as_i64().unwrap_or_default();
            Ok(counter)
        }
    }

    fn stored(event_type: &str, aggregate_type: &str, data: Value) -> StoredEvent {
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();
        StoredEvent::from_uncommitted(
            "counter-1",
            1,
            UncommittedEvent::new(aggregate_type, event_type, data, now),
        )
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = EventRegistry::<CounterEvent>::new("counter");
        registry
            .register("counter.incremented", CounterEvent::Incremented)
            .unwrap();

        let result = registry.register("counter.incremented", CounterEvent::Incremented);

        assert!(matches!(result, Err(DomainError::Dispatch(_))));
    }

    #[test]
    fn test_decode_unknown_event_type_fails_fast() {
        let registry = registry_for::<Counter>().unwrap();

        let result = registry.decode(&stored("counter.reset", "counter", serde_json::json!({})));

        match result {
            Err(DomainError::UnknownEventType {
                aggregate_type,
                event_type,
            }) => {
                assert_eq!(aggregate_type, "counter");
                assert_eq!(event_type, "counter.reset");
            }
            other => panic!("expected UnknownEventType, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_foreign_aggregate_type() {
        let registry = registry_for::<Counter>().unwrap();

        let result = registry.decode(&stored(
            "counter.incremented",
            "order",
            serde_json::json!({"by": 1}),
        ));

        assert!(matches!(result, Err(DomainError::Validation(_))));
    }

    #[test]
    fn test_decode_produces_variant() {
        let registry = registry_for::<Counter>().unwrap();

        let event = registry
            .decode(&stored(
                "counter.incremented",
                "counter",
                serde_json::json!({"by": 4}),
            ))
            .unwrap();

        let CounterEvent::Incremented(payload) = event;
        assert_eq!(payload.by, 4);
    }

    #[test]
    fn test_raise_applies_and_buffers_event() {
        let mut counter = Counter::new("counter-1");

        counter
            .raise(
                CounterEvent::Incremented(Incremented { by: 2 }),
                &EventContext::default(),
                &SystemClock,
            )
            .unwrap();

        assert_eq!(counter.version(), 1);
        assert_eq!(counter.total, 2);
        assert_eq!(counter.uncommitted_events().len(), 1);
        assert_eq!(counter.uncommitted_events()[0].event_type, "counter.incremented");
        assert_eq!(counter.uncommitted_events()[0].aggregate_type, "counter");
    }
}
