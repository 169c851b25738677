//! Integration tests for `ProjectionManager` over the in-memory store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use covenant_core::error::DomainError;
use covenant_core::event::{StoredEvent, UncommittedEvent};
use covenant_core::store::EventStore;
use covenant_cqrs::{InMemoryCheckpointStore, ProjectionManager, projection_handler_fn};
use covenant_event_store::InMemoryEventStore;
use covenant_test_support::FixedClock;
use uuid::Uuid;

const PROJECTION: &str = "order_summary";

fn at(second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, second).unwrap()
}

fn event(event_type: &str, second: u32) -> UncommittedEvent {
    UncommittedEvent::new("order", event_type, serde_json::json!({"s": second}), at(second))
}

struct Harness {
    store: Arc<InMemoryEventStore>,
    manager: ProjectionManager,
    seen: Arc<Mutex<Vec<Uuid>>>,
}

impl Harness {
    fn new(poll_interval: Duration) -> Self {
        let store = Arc::new(InMemoryEventStore::new());
        let manager = ProjectionManager::new(
            Arc::clone(&store) as Arc<dyn EventStore>,
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::new(FixedClock(at(59))),
            poll_interval,
        );
        Self {
            store,
            manager,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn subscribe(&self, event_type: &str) {
        let seen = Arc::clone(&self.seen);
        self.manager
            .register(
                event_type,
                PROJECTION,
                projection_handler_fn(move |event: StoredEvent| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.lock().unwrap().push(event.event_id);
                        Ok(())
                    }
                }),
            )
            .unwrap();
    }

    async fn append(&self, aggregate_id: &str, events: Vec<UncommittedEvent>) -> Vec<Uuid> {
        let version = self.store.stream_version(aggregate_id).await.unwrap();
        self.store
            .append_events(aggregate_id, events, version)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_id)
            .collect()
    }

    fn seen(&self) -> Vec<Uuid> {
        self.seen.lock().unwrap().clone()
    }

    async fn wait_for_seen(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.seen.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("projection did not catch up in time");
    }
}

#[tokio::test]
async fn test_projection_resumes_from_checkpoint_after_restart() {
    // Arrange
    let harness = Harness::new(Duration::from_millis(10));
    harness.subscribe("order.noted");
    let first_five = harness
        .append("order-1", (1..=5).map(|s| event("order.noted", s)).collect())
        .await;

    // Act
    harness.manager.start(PROJECTION).await.unwrap();
    harness.wait_for_seen(5).await;
    harness.manager.stop(PROJECTION).await.unwrap();
    assert!(!harness.manager.is_running(PROJECTION).await);

    let sixth = harness.append("order-1", vec![event("order.noted", 6)]).await;
    harness.manager.start(PROJECTION).await.unwrap();
    harness.wait_for_seen(6).await;
    harness.manager.stop(PROJECTION).await.unwrap();

    // Assert
    let mut expected = first_five;
    expected.extend(sixth);
    assert_eq!(harness.seen(), expected);
    let checkpoint = harness.manager.checkpoint(PROJECTION).await.unwrap().unwrap();
    assert_eq!(checkpoint.events_processed, 6);
    assert_eq!(checkpoint.last_timestamp, Some(at(6)));
}

#[tokio::test]
async fn test_poll_applies_events_of_all_types_in_timestamp_order() {
    // Arrange
    let harness = Harness::new(Duration::from_secs(60));
    harness.subscribe("order.placed");
    harness.subscribe("order.shipped");
    let order_one = harness
        .append("order-1", vec![event("order.placed", 1), event("order.shipped", 4)])
        .await;
    let order_two = harness.append("order-2", vec![event("order.placed", 2)]).await;

    // Act
    let applied = harness.manager.poll_once(PROJECTION).await.unwrap();

    // Assert
    assert_eq!(applied, 3);
    assert_eq!(harness.seen(), vec![order_one[0], order_two[0], order_one[1]]);
}

#[tokio::test]
async fn test_events_sharing_the_checkpoint_timestamp_are_not_lost_or_repeated() {
    // Arrange
    let harness = Harness::new(Duration::from_secs(60));
    harness.subscribe("order.placed");
    let first = harness.append("order-1", vec![event("order.placed", 3)]).await;
    harness.manager.poll_once(PROJECTION).await.unwrap();

    // Act
    let second = harness.append("order-2", vec![event("order.placed", 3)]).await;
    let applied = harness.manager.poll_once(PROJECTION).await.unwrap();

    // Assert
    assert_eq!(applied, 1);
    assert_eq!(harness.seen(), vec![first[0], second[0]]);
}

#[tokio::test]
async fn test_handler_error_stops_batch_and_is_retried_next_poll() {
    // Arrange
    let harness = Harness::new(Duration::from_secs(60));
    let attempts = Arc::new(Mutex::new(Vec::<Uuid>::new()));
    let fail_once = Arc::new(Mutex::new(true));
    {
        let attempts = Arc::clone(&attempts);
        let fail_once = Arc::clone(&fail_once);
        harness
            .manager
            .register(
                "order.placed",
                PROJECTION,
                projection_handler_fn(move |event: StoredEvent| {
                    let attempts = Arc::clone(&attempts);
                    let fail_once = Arc::clone(&fail_once);
                    async move {
                        attempts.lock().unwrap().push(event.event_id);
                        if event.version == 2 && std::mem::take(&mut *fail_once.lock().unwrap()) {
                            return Err(DomainError::EventSourcing("read model offline".into()));
                        }
                        Ok(())
                    }
                }),
            )
            .unwrap();
    }
    let ids = harness
        .append("order-1", (1..=3).map(|s| event("order.placed", s)).collect())
        .await;

    // Act
    let first_poll = harness.manager.poll_once(PROJECTION).await.unwrap();
    let after_failure = harness.manager.checkpoint(PROJECTION).await.unwrap().unwrap();
    let second_poll = harness.manager.poll_once(PROJECTION).await.unwrap();
    let after_retry = harness.manager.checkpoint(PROJECTION).await.unwrap().unwrap();

    // Assert
    assert_eq!(first_poll, 1);
    assert_eq!(
        after_failure.last_error.as_deref(),
        Some("event store error: read model offline")
    );
    assert_eq!(after_failure.last_timestamp, Some(at(1)));
    assert_eq!(second_poll, 2);
    assert!(after_retry.last_error.is_none());
    assert_eq!(after_retry.events_processed, 3);
    assert_eq!(
        *attempts.lock().unwrap(),
        vec![ids[0], ids[1], ids[1], ids[2]]
    );
}

#[tokio::test]
async fn test_reset_replays_from_the_first_event() {
    // Arrange
    let harness = Harness::new(Duration::from_secs(60));
    harness.subscribe("order.placed");
    harness
        .append("order-1", vec![event("order.placed", 1), event("order.placed", 2)])
        .await;
    harness.manager.poll_once(PROJECTION).await.unwrap();

    // Act
    harness.manager.reset(PROJECTION).await.unwrap();
    let replayed = harness.manager.poll_once(PROJECTION).await.unwrap();

    // Assert
    assert_eq!(replayed, 2);
    assert_eq!(harness.seen().len(), 4);
}

#[tokio::test]
async fn test_unknown_projection_is_a_dispatch_error() {
    let harness = Harness::new(Duration::from_secs(60));

    let started = harness.manager.start("missing").await;
    let polled = harness.manager.poll_once("missing").await;

    assert!(matches!(started, Err(DomainError::Dispatch(_))));
    assert!(matches!(polled, Err(DomainError::Dispatch(_))));
}

#[tokio::test]
async fn test_duplicate_event_type_in_one_projection_is_rejected() {
    let harness = Harness::new(Duration::from_secs(60));
    harness.subscribe("order.placed");

    let result = harness.manager.register(
        "order.placed",
        PROJECTION,
        projection_handler_fn(|_event: StoredEvent| async { Ok(()) }),
    );

    assert!(matches!(result, Err(DomainError::Dispatch(_))));
}
