//! Saga execution.
//!
//! Each started saga runs in its own task. Steps run strictly in order;
//! every state change is written to the [`SagaStore`] before the task moves
//! on, so `status` always reflects the last completed transition.
//! Cancellation is checked between steps and between retry attempts; an
//! attempt already in flight always finishes and is recorded.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use covenant_core::clock::Clock;
use covenant_core::command::Command;
use covenant_core::rng::DeterministicRng;
use covenant_cqrs::CommandBus;

use crate::error::SagaError;
use crate::saga::{CompensationFailure, SagaState, SagaStep, SagaTransaction};
use crate::store::SagaStore;

/// Command metadata key carrying the saga id.
pub const SAGA_ID_KEY: &str = "saga_id";
/// Command metadata key carrying the step id.
pub const STEP_ID_KEY: &str = "step_id";
/// Command metadata key carrying the saga context.
pub const SAGA_CONTEXT_KEY: &str = "saga_context";

struct RunningSaga {
    cancel: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

struct Inner {
    bus: Arc<CommandBus>,
    store: Arc<dyn SagaStore>,
    clock: Arc<dyn Clock>,
    rng: Mutex<Box<dyn DeterministicRng>>,
    running: Mutex<HashMap<String, RunningSaga>>,
}

/// Runs sagas against a command bus.
#[derive(Clone)]
pub struct SagaOrchestrator {
    inner: Arc<Inner>,
}

impl fmt::Debug for SagaOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaOrchestrator").finish_non_exhaustive()
    }
}

/// Resolves once cancellation is requested. Never resolves if the sender is
/// gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

impl SagaOrchestrator {
    /// Creates an orchestrator. `rng` supplies retry jitter.
    #[must_use]
    pub fn new(
        bus: Arc<CommandBus>,
        store: Arc<dyn SagaStore>,
        clock: Arc<dyn Clock>,
        rng: Box<dyn DeterministicRng>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                store,
                clock,
                rng: Mutex::new(rng),
                running: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Validates and persists `saga`, moves it to `Executing` and runs it in
    /// a background task. Returns the saga id.
    ///
    /// # Errors
    ///
    /// Returns `SagaError::InvalidState` unless the saga is `Created`,
    /// `SagaError::Validation` for a malformed definition or a reused id,
    /// and `SagaError::Store` if it cannot be persisted.
    #[instrument(skip(self, saga), fields(saga_id = %saga.saga_id, saga_type = %saga.saga_type))]
    pub async fn start(&self, mut saga: SagaTransaction) -> Result<String, SagaError> {
        if saga.state != SagaState::Created {
            return Err(SagaError::InvalidState {
                saga_id: saga.saga_id,
                state: saga.state,
                operation: "start",
            });
        }
        saga.validate()?;
        if saga.current_step_index != 0
            || !saga.completed_steps.is_empty()
            || !saga.compensated_steps.is_empty()
            || !saga.compensation_failures.is_empty()
            || saga.failure.is_some()
        {
            return Err(SagaError::Validation(format!(
                "saga `{}` must be started without recorded progress",
                saga.saga_id
            )));
        }

        saga.transition_to(SagaState::Executing, self.inner.clock.now())?;
        if !self.inner.store.insert_new(&saga).await? {
            return Err(SagaError::Validation(format!(
                "saga id `{}` is already in use",
                saga.saga_id
            )));
        }

        let saga_id = saga.saga_id.clone();
        let steps = saga.steps.len();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        {
            let mut running = self
                .inner
                .running
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            running.insert(
                saga_id.clone(),
                RunningSaga {
                    cancel: cancel_tx,
                    done: done_rx,
                },
            );
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                inner.run(saga, cancel_rx).await;
                let _ = done_tx.send(true);
            });
        }

        info!(steps, "saga started");
        Ok(saga_id)
    }

    /// Requests cancellation of an executing saga. The running task lets the
    /// in-flight attempt finish, records it if it succeeded, then stops
    /// forward progress and compensates exactly as after a step failure.
    ///
    /// # Errors
    ///
    /// Returns `SagaError::NotFound` for an unknown saga and
    /// `SagaError::InvalidState` unless it is `Executing`.
    #[instrument(skip(self))]
    pub async fn cancel(&self, saga_id: &str) -> Result<(), SagaError> {
        let saga = self.status(saga_id).await?;
        let invalid = || SagaError::InvalidState {
            saga_id: saga_id.to_owned(),
            state: saga.state,
            operation: "cancel",
        };
        if saga.state != SagaState::Executing {
            return Err(invalid());
        }
        let running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let handle = running.get(saga_id).ok_or_else(invalid)?;
        let _ = handle.cancel.send(true);
        info!("saga cancellation requested");
        Ok(())
    }

    /// Returns the current record of a saga.
    ///
    /// # Errors
    ///
    /// Returns `SagaError::NotFound` for an unknown saga.
    pub async fn status(&self, saga_id: &str) -> Result<SagaTransaction, SagaError> {
        self.inner
            .store
            .load(saga_id)
            .await?
            .ok_or_else(|| SagaError::NotFound(saga_id.to_owned()))
    }

    /// Lists every known saga.
    ///
    /// # Errors
    ///
    /// Returns `SagaError::Store` on backend failure.
    pub async fn list(&self) -> Result<Vec<SagaTransaction>, SagaError> {
        self.inner.store.list().await
    }

    /// Waits for a running saga to finish and returns its final record. A
    /// saga that is not running is returned as stored.
    ///
    /// # Errors
    ///
    /// Returns `SagaError::NotFound` for an unknown saga.
    pub async fn wait(&self, saga_id: &str) -> Result<SagaTransaction, SagaError> {
        let done = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(saga_id)
            .map(|r| r.done.clone());
        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.status(saga_id).await
    }
}

impl Inner {
    #[instrument(skip_all, fields(saga_id = %saga.saga_id, saga_type = %saga.saga_type))]
    async fn run(&self, mut saga: SagaTransaction, mut cancel: watch::Receiver<bool>) {
        match self.execute_steps(&mut saga, &mut cancel).await {
            Ok(()) => {
                self.transition(&mut saga, SagaState::Completed);
                info!(completed = saga.completed_steps.len(), "saga completed");
            }
            Err(reason) => {
                warn!(%reason, "saga stopped; compensating");
                saga.failure = Some(reason);
                self.compensate(&mut saga).await;
            }
        }
        self.persist(&saga).await;
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&saga.saga_id);
    }

    async fn execute_steps(
        &self,
        saga: &mut SagaTransaction,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), String> {
        for index in 0..saga.steps.len() {
            if *cancel.borrow() {
                return Err(SagaError::Cancelled.to_string());
            }
            saga.current_step_index = index;
            saga.updated_at = self.clock.now();
            self.persist(saga).await;

            let step = saga.steps[index].clone();
            let command = step_command(saga, &step, &step.action);
            debug!(step_id = %step.step_id, "executing step");

            match self.invoke(&step, command, Some(&mut *cancel)).await {
                Ok(result) => {
                    saga.completed_steps.push(step.step_id.clone());
                    saga.context.insert(step.step_id.clone(), result);
                    saga.updated_at = self.clock.now();
                    self.persist(saga).await;
                    debug!(step_id = %step.step_id, "step completed");
                }
                Err(e) => {
                    warn!(step_id = %step.step_id, error = %e, "step failed");
                    return Err(e.to_string());
                }
            }
        }
        if *cancel.borrow() {
            info!("saga cancelled after its last step");
            return Err(SagaError::Cancelled.to_string());
        }
        Ok(())
    }

    async fn compensate(&self, saga: &mut SagaTransaction) {
        let missing: Vec<String> = saga
            .completed_steps
            .iter()
            .filter_map(|step_id| saga.step(step_id))
            .filter(|step| !self.bus.has_handler(&step.compensation.command_type))
            .map(|step| step.compensation.command_type.clone())
            .collect();
        if !missing.is_empty() {
            let reason = format!(
                "compensation cannot be attempted: no handler for {}",
                missing.join(", ")
            );
            error!(%reason, "saga failed");
            saga.failure = Some(match saga.failure.take() {
                Some(cause) => format!("{cause}; {reason}"),
                None => reason,
            });
            self.transition(saga, SagaState::Failed);
            return;
        }

        self.transition(saga, SagaState::Compensating);
        self.persist(saga).await;

        let to_compensate: Vec<String> = saga.completed_steps.iter().rev().cloned().collect();
        for step_id in to_compensate {
            let Some(step) = saga.step(&step_id).cloned() else {
                continue;
            };
            let command = step_command(saga, &step, &step.compensation);
            match self.invoke(&step, command, None).await {
                Ok(_) => debug!(%step_id, "step compensated"),
                Err(e) => {
                    let failure = SagaError::Compensation {
                        step_id: step_id.clone(),
                        reason: e.to_string(),
                    };
                    error!(error = %failure, "compensation failed");
                    saga.compensation_failures.push(CompensationFailure {
                        step_id: step_id.clone(),
                        error: failure.to_string(),
                    });
                }
            }
            saga.compensated_steps.push(step_id);
            saga.updated_at = self.clock.now();
            self.persist(saga).await;
        }

        self.transition(saga, SagaState::Compensated);
        info!(
            compensated = saga.compensated_steps.len(),
            failures = saga.compensation_failures.len(),
            "saga compensated"
        );
    }

    /// Runs one step command with the step's timeout and retry policy.
    ///
    /// A started attempt always runs to completion or timeout. `cancel` is
    /// only consulted between attempts, where it cuts the backoff short.
    async fn invoke(
        &self,
        step: &SagaStep,
        command: Command,
        mut cancel: Option<&mut watch::Receiver<bool>>,
    ) -> Result<Value, SagaError> {
        let policy = &step.retry_policy;
        let mut attempt = 1;
        loop {
            let failure = match tokio::time::timeout(step.timeout, self.bus.execute(command.clone()))
                .await
            {
                Err(_) => SagaError::Timeout {
                    step_id: step.step_id.clone(),
                    timeout: step.timeout,
                },
                Ok(Err(e)) => return Err(SagaError::Dispatch(e.to_string())),
                Ok(Ok(result)) if result.success => {
                    return Ok(result.result.unwrap_or(Value::Null));
                }
                Ok(Ok(result)) => SagaError::StepFailed {
                    step_id: step.step_id.clone(),
                    reason: result.error.unwrap_or_default(),
                },
            };
            if attempt >= policy.max_attempts {
                return Err(failure);
            }
            if cancel.as_deref().is_some_and(|c| *c.borrow()) {
                return Err(SagaError::Cancelled);
            }
            let delay = {
                let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
                policy.backoff(attempt, rng.as_mut())
            };
            warn!(
                step_id = %step.step_id,
                command_type = %command.command_type,
                attempt,
                ?delay,
                error = %failure,
                "step attempt failed; retrying"
            );
            match cancel.as_deref_mut() {
                Some(cancel) => {
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancelled(cancel) => {
                            info!(step_id = %step.step_id, "saga cancelled while waiting to retry");
                            return Err(SagaError::Cancelled);
                        }
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
            attempt += 1;
        }
    }

    fn transition(&self, saga: &mut SagaTransaction, next: SagaState) {
        if let Err(e) = saga.transition_to(next, self.clock.now()) {
            error!(error = %e, "illegal saga transition");
        }
    }

    async fn persist(&self, saga: &SagaTransaction) {
        if let Err(e) = self.store.save(saga).await {
            error!(saga_id = %saga.saga_id, error = %e, "failed to persist saga");
        }
    }
}

/// Stamps a step command with the saga id, step id and current context.
fn step_command(saga: &SagaTransaction, step: &SagaStep, template: &Command) -> Command {
    template
        .clone()
        .with_metadata(SAGA_ID_KEY, Value::String(saga.saga_id.clone()))
        .with_metadata(STEP_ID_KEY, Value::String(step.step_id.clone()))
        .with_metadata(SAGA_CONTEXT_KEY, Value::Object(saga.context.clone()))
}
