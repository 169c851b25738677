//! Integration tests for `SagaOrchestrator` over the in-memory saga store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use covenant_core::command::Command;
use covenant_core::error::DomainError;
use covenant_cqrs::{CommandBus, command_handler_fn};
use covenant_saga::{
    InMemorySagaStore, RetryPolicy, SagaError, SagaOrchestrator, SagaState, SagaStep,
    SagaTransaction,
};
use covenant_test_support::{FixedClock, MockRng};
use serde_json::{Value, json};
use tokio::sync::Notify;

type Calls = Arc<Mutex<Vec<String>>>;

struct Harness {
    bus: Arc<CommandBus>,
    orchestrator: SagaOrchestrator,
    calls: Calls,
}

impl Harness {
    fn new() -> Self {
        let bus = Arc::new(CommandBus::new());
        let orchestrator = SagaOrchestrator::new(
            Arc::clone(&bus),
            Arc::new(InMemorySagaStore::new()),
            Arc::new(FixedClock(
                Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap(),
            )),
            Box::new(MockRng),
        );
        Self {
            bus,
            orchestrator,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Registers a handler that records the call and returns `{"ok": type}`.
    fn succeed(&self, command_type: &str) {
        let calls = Arc::clone(&self.calls);
        let name = command_type.to_owned();
        self.bus
            .register(
                command_type,
                command_handler_fn(move |_command: Command| {
                    let calls = Arc::clone(&calls);
                    let name = name.clone();
                    async move {
                        calls.lock().unwrap().push(name.clone());
                        Ok(json!({ "ok": name }))
                    }
                }),
            )
            .unwrap();
    }

    /// Registers a handler that records the call and always fails.
    fn fail(&self, command_type: &str, reason: &str) {
        let calls = Arc::clone(&self.calls);
        let name = command_type.to_owned();
        let reason = reason.to_owned();
        self.bus
            .register(
                command_type,
                command_handler_fn(move |_command: Command| {
                    let calls = Arc::clone(&calls);
                    let name = name.clone();
                    let reason = reason.clone();
                    async move {
                        calls.lock().unwrap().push(name);
                        Err(DomainError::Validation(reason))
                    }
                }),
            )
            .unwrap();
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

fn step(step_id: &str, action: &str, compensation: &str) -> SagaStep {
    SagaStep::new(
        step_id,
        Command::new(action, "order-1", json!({})),
        Command::new(compensation, "order-1", json!({})),
    )
}

fn saga(steps: Vec<SagaStep>) -> SagaTransaction {
    SagaTransaction::new(
        "order_fulfillment",
        steps,
        Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap(),
    )
}

fn fulfillment_steps() -> Vec<SagaStep> {
    vec![
        step("reserve_inventory", "inventory.reserve", "inventory.release"),
        step("charge_payment", "payment.charge", "payment.refund"),
        step("schedule_shipment", "shipment.schedule", "shipment.cancel"),
    ]
}

#[tokio::test]
async fn test_all_steps_succeed_and_results_land_in_context() {
    // Arrange
    let harness = Harness::new();
    for command_type in [
        "inventory.reserve",
        "inventory.release",
        "payment.charge",
        "payment.refund",
        "shipment.schedule",
        "shipment.cancel",
    ] {
        harness.succeed(command_type);
    }

    // Act
    let saga_id = harness
        .orchestrator
        .start(saga(fulfillment_steps()))
        .await
        .unwrap();
    let finished = harness.orchestrator.wait(&saga_id).await.unwrap();

    // Assert
    assert_eq!(finished.state, SagaState::Completed);
    assert_eq!(
        finished.completed_steps,
        vec!["reserve_inventory", "charge_payment", "schedule_shipment"]
    );
    assert!(finished.compensated_steps.is_empty());
    assert_eq!(
        finished.context.get("charge_payment"),
        Some(&json!({"ok": "payment.charge"}))
    );
    assert_eq!(
        harness.calls(),
        vec!["inventory.reserve", "payment.charge", "shipment.schedule"]
    );
}

#[tokio::test]
async fn test_step_commands_carry_saga_metadata_and_prior_results() {
    // Arrange
    let harness = Harness::new();
    harness.succeed("inventory.reserve");
    harness.succeed("inventory.release");
    harness.succeed("payment.refund");
    let seen: Arc<Mutex<Option<Command>>> = Arc::new(Mutex::new(None));
    {
        let seen = Arc::clone(&seen);
        harness
            .bus
            .register(
                "payment.charge",
                command_handler_fn(move |command: Command| {
                    let seen = Arc::clone(&seen);
                    async move {
                        *seen.lock().unwrap() = Some(command);
                        Ok(Value::Null)
                    }
                }),
            )
            .unwrap();
    }
    let definition = saga(fulfillment_steps()[..2].to_vec())
        .with_id("saga-42")
        .with_context("customer", json!("c-7"));

    // Act
    harness.orchestrator.start(definition).await.unwrap();
    harness.orchestrator.wait("saga-42").await.unwrap();

    // Assert
    let command = seen.lock().unwrap().clone().unwrap();
    assert_eq!(command.metadata.get("saga_id"), Some(&json!("saga-42")));
    assert_eq!(command.metadata.get("step_id"), Some(&json!("charge_payment")));
    let context = command.metadata.get("saga_context").unwrap();
    assert_eq!(context["customer"], json!("c-7"));
    assert_eq!(
        context["reserve_inventory"],
        json!({"ok": "inventory.reserve"})
    );
}

#[tokio::test]
async fn test_failed_payment_releases_inventory_and_never_schedules_shipment() {
    // Arrange
    let harness = Harness::new();
    harness.succeed("inventory.reserve");
    harness.succeed("inventory.release");
    harness.fail("payment.charge", "card declined");
    harness.succeed("payment.refund");
    harness.succeed("shipment.schedule");
    harness.succeed("shipment.cancel");

    // Act
    let saga_id = harness
        .orchestrator
        .start(saga(fulfillment_steps()))
        .await
        .unwrap();
    let finished = harness.orchestrator.wait(&saga_id).await.unwrap();

    // Assert
    assert_eq!(finished.state, SagaState::Compensated);
    assert_eq!(finished.completed_steps, vec!["reserve_inventory"]);
    assert_eq!(finished.compensated_steps, vec!["reserve_inventory"]);
    assert!(finished.failure.unwrap().contains("card declined"));
    assert_eq!(
        harness.calls(),
        vec!["inventory.reserve", "payment.charge", "inventory.release"]
    );
}

#[tokio::test]
async fn test_compensation_runs_in_reverse_completion_order() {
    // Arrange
    let harness = Harness::new();
    for command_type in ["a.do", "a.undo", "b.do", "b.undo", "c.do", "c.undo"] {
        harness.succeed(command_type);
    }
    harness.fail("d.do", "boom");
    harness.succeed("d.undo");
    let steps = vec![
        step("a", "a.do", "a.undo"),
        step("b", "b.do", "b.undo"),
        step("c", "c.do", "c.undo"),
        step("d", "d.do", "d.undo"),
    ];

    // Act
    let saga_id = harness.orchestrator.start(saga(steps)).await.unwrap();
    let finished = harness.orchestrator.wait(&saga_id).await.unwrap();

    // Assert
    assert_eq!(finished.state, SagaState::Compensated);
    assert_eq!(finished.compensated_steps, vec!["c", "b", "a"]);
    assert_eq!(
        harness.calls(),
        vec!["a.do", "b.do", "c.do", "d.do", "c.undo", "b.undo", "a.undo"]
    );
}

#[tokio::test]
async fn test_step_exceeding_its_timeout_fails_the_saga() {
    // Arrange
    let harness = Harness::new();
    harness.succeed("inventory.reserve");
    harness.succeed("inventory.release");
    harness.succeed("payment.refund");
    harness
        .bus
        .register(
            "payment.charge",
            command_handler_fn(|_command: Command| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Value::Null)
            }),
        )
        .unwrap();
    let mut steps = fulfillment_steps()[..2].to_vec();
    steps[1] = steps[1].clone().with_timeout(Duration::from_millis(20));

    // Act
    let saga_id = harness.orchestrator.start(saga(steps)).await.unwrap();
    let finished = harness.orchestrator.wait(&saga_id).await.unwrap();

    // Assert
    assert_eq!(finished.state, SagaState::Compensated);
    assert!(finished.failure.unwrap().contains("timed out"));
    assert_eq!(finished.compensated_steps, vec!["reserve_inventory"]);
}

#[tokio::test]
async fn test_failing_step_is_retried_until_it_succeeds() {
    // Arrange
    let harness = Harness::new();
    let attempts = Arc::new(Mutex::new(0_u32));
    {
        let attempts = Arc::clone(&attempts);
        harness
            .bus
            .register(
                "payment.charge",
                command_handler_fn(move |_command: Command| {
                    let attempts = Arc::clone(&attempts);
                    async move {
                        let mut attempts = attempts.lock().unwrap();
                        *attempts += 1;
                        if *attempts < 3 {
                            return Err(DomainError::Validation("gateway busy".into()));
                        }
                        Ok(json!({"charged": true}))
                    }
                }),
            )
            .unwrap();
    }
    harness.succeed("payment.refund");
    let charge = step("charge_payment", "payment.charge", "payment.refund")
        .with_retry_policy(RetryPolicy::exponential(3, Duration::from_millis(1)));

    // Act
    let saga_id = harness.orchestrator.start(saga(vec![charge])).await.unwrap();
    let finished = harness.orchestrator.wait(&saga_id).await.unwrap();

    // Assert
    assert_eq!(finished.state, SagaState::Completed);
    assert_eq!(*attempts.lock().unwrap(), 3);
    assert_eq!(finished.context["charge_payment"], json!({"charged": true}));
}

#[tokio::test]
async fn test_missing_handler_is_a_dispatch_failure_and_not_retried() {
    // Arrange
    let harness = Harness::new();
    harness.succeed("inventory.reserve");
    harness.succeed("inventory.release");
    let steps = vec![
        step("reserve_inventory", "inventory.reserve", "inventory.release"),
        step("charge_payment", "payment.charge", "inventory.release")
            .with_retry_policy(RetryPolicy::exponential(5, Duration::from_secs(10))),
    ];

    // Act
    let saga_id = harness.orchestrator.start(saga(steps)).await.unwrap();
    let finished = tokio::time::timeout(
        Duration::from_secs(2),
        harness.orchestrator.wait(&saga_id),
    )
    .await
    .expect("dispatch failures must not be retried")
    .unwrap();

    // Assert
    assert_eq!(finished.state, SagaState::Compensated);
    assert!(finished.failure.unwrap().starts_with("dispatch error"));
}

#[tokio::test]
async fn test_missing_compensation_handler_fails_the_saga() {
    // Arrange
    let harness = Harness::new();
    harness.succeed("inventory.reserve");
    harness.fail("payment.charge", "card declined");
    harness.succeed("payment.refund");

    // Act
    let saga_id = harness
        .orchestrator
        .start(saga(fulfillment_steps()[..2].to_vec()))
        .await
        .unwrap();
    let finished = harness.orchestrator.wait(&saga_id).await.unwrap();

    // Assert
    assert_eq!(finished.state, SagaState::Failed);
    assert!(finished.compensated_steps.is_empty());
    assert!(finished.failure.unwrap().contains("inventory.release"));
}

#[tokio::test]
async fn test_failed_compensation_is_recorded_and_the_rest_still_run() {
    // Arrange
    let harness = Harness::new();
    harness.succeed("inventory.reserve");
    harness.succeed("inventory.release");
    harness.succeed("payment.charge");
    harness.fail("payment.refund", "refund rejected");
    harness.fail("shipment.schedule", "no carrier");
    harness.succeed("shipment.cancel");

    // Act
    let saga_id = harness
        .orchestrator
        .start(saga(fulfillment_steps()))
        .await
        .unwrap();
    let finished = harness.orchestrator.wait(&saga_id).await.unwrap();

    // Assert
    assert_eq!(finished.state, SagaState::Compensated);
    assert_eq!(
        finished.compensated_steps,
        vec!["charge_payment", "reserve_inventory"]
    );
    assert_eq!(finished.compensation_failures.len(), 1);
    assert_eq!(finished.compensation_failures[0].step_id, "charge_payment");
    assert!(
        finished.compensation_failures[0]
            .error
            .contains("refund rejected")
    );
    assert_eq!(harness.calls().last().unwrap(), "inventory.release");
}

#[tokio::test]
async fn test_cancel_lets_the_running_step_finish_then_compensates_it() {
    // Arrange
    let harness = Harness::new();
    for command_type in [
        "inventory.reserve",
        "inventory.release",
        "payment.refund",
        "shipment.schedule",
        "shipment.cancel",
    ] {
        harness.succeed(command_type);
    }
    let entered = Arc::new(Notify::new());
    {
        let entered = Arc::clone(&entered);
        let calls = Arc::clone(&harness.calls);
        harness
            .bus
            .register(
                "payment.charge",
                command_handler_fn(move |_command: Command| {
                    let entered = Arc::clone(&entered);
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.lock().unwrap().push("payment.charge".into());
                        entered.notify_one();
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(json!({"charged": true}))
                    }
                }),
            )
            .unwrap();
    }
    let saga_id = harness
        .orchestrator
        .start(saga(fulfillment_steps()))
        .await
        .unwrap();
    entered.notified().await;

    // Act
    harness.orchestrator.cancel(&saga_id).await.unwrap();
    let finished = tokio::time::timeout(
        Duration::from_secs(2),
        harness.orchestrator.wait(&saga_id),
    )
    .await
    .expect("cancelled saga did not finish")
    .unwrap();

    // Assert
    assert_eq!(finished.state, SagaState::Compensated);
    assert_eq!(
        finished.completed_steps,
        vec!["reserve_inventory", "charge_payment"]
    );
    assert_eq!(
        finished.compensated_steps,
        vec!["charge_payment", "reserve_inventory"]
    );
    assert_eq!(finished.failure.as_deref(), Some("saga cancelled"));
    assert_eq!(
        harness.calls(),
        vec![
            "inventory.reserve",
            "payment.charge",
            "payment.refund",
            "inventory.release",
        ]
    );
}

#[tokio::test]
async fn test_cancel_during_retry_backoff_stops_retrying() {
    // Arrange
    let harness = Harness::new();
    harness.succeed("inventory.reserve");
    harness.succeed("inventory.release");
    harness.succeed("payment.refund");
    let failed_once = Arc::new(Notify::new());
    {
        let failed_once = Arc::clone(&failed_once);
        let calls = Arc::clone(&harness.calls);
        harness
            .bus
            .register(
                "payment.charge",
                command_handler_fn(move |_command: Command| {
                    let failed_once = Arc::clone(&failed_once);
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.lock().unwrap().push("payment.charge".into());
                        failed_once.notify_one();
                        Err(DomainError::Validation("gateway unavailable".into()))
                    }
                }),
            )
            .unwrap();
    }
    let mut steps = fulfillment_steps()[..2].to_vec();
    steps[1].retry_policy = RetryPolicy {
        max_attempts: 5,
        initial_backoff: Duration::from_secs(10),
        max_backoff: Duration::from_secs(10),
        multiplier: 1.0,
        jitter: false,
    };
    let saga_id = harness.orchestrator.start(saga(steps)).await.unwrap();
    failed_once.notified().await;

    // Act
    harness.orchestrator.cancel(&saga_id).await.unwrap();
    let finished = tokio::time::timeout(
        Duration::from_secs(2),
        harness.orchestrator.wait(&saga_id),
    )
    .await
    .expect("backoff was not cut short")
    .unwrap();

    // Assert
    assert_eq!(finished.state, SagaState::Compensated);
    assert_eq!(finished.failure.as_deref(), Some("saga cancelled"));
    assert_eq!(finished.completed_steps, vec!["reserve_inventory"]);
    assert_eq!(finished.compensated_steps, vec!["reserve_inventory"]);
    assert_eq!(
        harness.calls(),
        vec!["inventory.reserve", "payment.charge", "inventory.release"]
    );
}

#[tokio::test]
async fn test_cancel_of_a_finished_saga_is_rejected() {
    // Arrange
    let harness = Harness::new();
    harness.succeed("inventory.reserve");
    harness.succeed("inventory.release");
    let saga_id = harness
        .orchestrator
        .start(saga(fulfillment_steps()[..1].to_vec()))
        .await
        .unwrap();
    harness.orchestrator.wait(&saga_id).await.unwrap();

    // Act
    let result = harness.orchestrator.cancel(&saga_id).await;

    // Assert
    assert!(matches!(
        result,
        Err(SagaError::InvalidState {
            state: SagaState::Completed,
            operation: "cancel",
            ..
        })
    ));
}

#[tokio::test]
async fn test_unknown_saga_is_not_found() {
    let harness = Harness::new();

    let status = harness.orchestrator.status("nope").await;
    let cancel = harness.orchestrator.cancel("nope").await;

    assert_eq!(status.unwrap_err(), SagaError::NotFound("nope".into()));
    assert_eq!(cancel.unwrap_err(), SagaError::NotFound("nope".into()));
}

#[tokio::test]
async fn test_start_rejects_a_saga_that_is_not_new() {
    // Arrange
    let harness = Harness::new();
    let mut definition = saga(fulfillment_steps());
    definition
        .transition_to(SagaState::Executing, Utc::now())
        .unwrap();

    // Act
    let result = harness.orchestrator.start(definition).await;

    // Assert
    assert!(matches!(result, Err(SagaError::InvalidState { operation: "start", .. })));
}

#[tokio::test]
async fn test_start_rejects_a_reused_saga_id() {
    // Arrange
    let harness = Harness::new();
    harness.succeed("inventory.reserve");
    harness.succeed("inventory.release");
    let first = saga(fulfillment_steps()[..1].to_vec()).with_id("saga-1");
    harness.orchestrator.start(first).await.unwrap();
    harness.orchestrator.wait("saga-1").await.unwrap();

    // Act
    let second = saga(fulfillment_steps()[..1].to_vec()).with_id("saga-1");
    let result = harness.orchestrator.start(second).await;

    // Assert
    assert!(matches!(result, Err(SagaError::Validation(_))));
    assert_eq!(harness.orchestrator.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_start_rejects_a_saga_with_recorded_progress() {
    // Arrange
    let harness = Harness::new();
    for command_type in ["inventory.reserve", "inventory.release", "payment.charge"] {
        harness.succeed(command_type);
    }
    let mut skipped_ahead = saga(fulfillment_steps()[..2].to_vec());
    skipped_ahead.current_step_index = 1;
    let mut pre_completed = saga(fulfillment_steps()[..2].to_vec());
    pre_completed.completed_steps = vec!["reserve_inventory".into()];

    // Act
    let skipped = harness.orchestrator.start(skipped_ahead).await;
    let completed = harness.orchestrator.start(pre_completed).await;

    // Assert
    assert!(matches!(skipped, Err(SagaError::Validation(_))));
    assert!(matches!(completed, Err(SagaError::Validation(_))));
    assert!(harness.orchestrator.list().await.unwrap().is_empty());
    assert!(harness.calls().is_empty());
}

#[tokio::test]
async fn test_concurrent_starts_with_one_id_admit_exactly_one() {
    // Arrange
    let harness = Harness::new();
    harness.succeed("inventory.reserve");
    harness.succeed("inventory.release");
    let definition = saga(fulfillment_steps()[..1].to_vec()).with_id("saga-7");

    // Act
    let (first, second) = tokio::join!(
        harness.orchestrator.start(definition.clone()),
        harness.orchestrator.start(definition.clone()),
    );
    harness.orchestrator.wait("saga-7").await.unwrap();

    // Assert
    assert_eq!(
        usize::from(first.is_ok()) + usize::from(second.is_ok()),
        1
    );
    assert_eq!(harness.calls(), vec!["inventory.reserve"]);
}
