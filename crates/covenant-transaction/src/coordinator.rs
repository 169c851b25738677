//! Two-phase commit coordination.
//!
//! Each transaction has its own `tokio` mutex so that `commit`, `abort` and
//! the timeout watchdog never interleave. The watchdog only force-aborts a
//! transaction that has not yet reached `Committing`. Coordination state is
//! dropped once a transaction is decided; later calls are answered from the
//! store.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, instrument, warn};

use covenant_core::clock::Clock;

use crate::error::{ParticipantError, TransactionError};
use crate::participant::ParticipantClient;
use crate::store::TransactionStore;
use crate::transaction::{
    DistributedTransaction, ParticipantOutcome, TransactionPhase, TransactionState,
};

/// Per-transaction coordination state held only in memory.
struct Entry {
    lock: Arc<tokio::sync::Mutex<()>>,
    deadline: Instant,
    watchdog: watch::Sender<bool>,
}

struct Inner {
    client: Arc<dyn ParticipantClient>,
    store: Arc<dyn TransactionStore>,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

/// Runs two-phase commit across the participants of each transaction.
#[derive(Clone)]
pub struct DistributedTransactionCoordinator {
    inner: Arc<Inner>,
}

impl fmt::Debug for DistributedTransactionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedTransactionCoordinator")
            .field("call_timeout", &self.inner.call_timeout)
            .finish_non_exhaustive()
    }
}

impl DistributedTransactionCoordinator {
    /// Creates a coordinator. `call_timeout` bounds every single participant
    /// call; the transaction's own timeout bounds the whole decision.
    #[must_use]
    pub fn new(
        client: Arc<dyn ParticipantClient>,
        store: Arc<dyn TransactionStore>,
        clock: Arc<dyn Clock>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                store,
                clock,
                call_timeout,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Registers `transaction` and arms its timeout watchdog. Returns the
    /// transaction id.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::InvalidState` unless the transaction is
    /// `Started`, `TransactionError::Validation` for a malformed or reused
    /// transaction, and `TransactionError::Store` if it cannot be saved.
    #[instrument(skip(self, transaction), fields(transaction_id = %transaction.transaction_id))]
    pub async fn begin(
        &self,
        transaction: DistributedTransaction,
    ) -> Result<String, TransactionError> {
        if transaction.state != TransactionState::Started {
            return Err(TransactionError::InvalidState {
                transaction_id: transaction.transaction_id,
                state: transaction.state,
                operation: "begin",
            });
        }
        transaction.validate()?;
        if !self.inner.store.insert_new(&transaction).await? {
            return Err(TransactionError::Validation(format!(
                "transaction id `{}` is already in use",
                transaction.transaction_id
            )));
        }

        let transaction_id = transaction.transaction_id.clone();
        let deadline = Instant::now() + transaction.timeout;
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                transaction_id.clone(),
                Entry {
                    lock: Arc::new(tokio::sync::Mutex::new(())),
                    deadline,
                    watchdog: cancel_tx,
                },
            );

        let inner = Arc::clone(&self.inner);
        let watched = transaction_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => inner.expire(&watched).await,
                _ = cancel_rx.changed() => {}
            }
        });

        info!(
            participants = transaction.participants.len(),
            timeout = ?transaction.timeout,
            "transaction started"
        );
        Ok(transaction_id)
    }

    /// Runs both protocol phases and returns the final record.
    ///
    /// A refusal or failure in the prepare phase aborts every participant
    /// and ends `Aborted` without any commit being sent. A failure in the
    /// commit phase ends `Failed`. Both are returned as data.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::NotFound` for an unknown transaction,
    /// `TransactionError::InvalidState` unless it is `Started`, and
    /// `TransactionError::Store` if a transition cannot be saved.
    #[instrument(skip(self))]
    pub async fn commit(
        &self,
        transaction_id: &str,
    ) -> Result<DistributedTransaction, TransactionError> {
        let (lock, deadline) = self.inner.entry(transaction_id, "commit").await?;
        let _guard = lock.lock().await;

        let mut transaction = self.status(transaction_id).await?;
        if transaction.state != TransactionState::Started {
            return Err(TransactionError::InvalidState {
                transaction_id: transaction_id.to_owned(),
                state: transaction.state,
                operation: "commit",
            });
        }
        if Instant::now() >= deadline {
            self.inner
                .abort_all(&mut transaction, "transaction timed out before commit".into())
                .await?;
            return Ok(transaction);
        }

        self.inner
            .transition(&mut transaction, TransactionState::Preparing)
            .await?;
        let votes = self
            .inner
            .call_all(&transaction, TransactionPhase::Prepare, Some(deadline))
            .await;
        let refusal = first_refusal(&votes);
        transaction.outcomes.extend(votes);
        if let Some(reason) = refusal {
            warn!(%reason, "prepare phase failed; aborting");
            self.inner.abort_all(&mut transaction, reason).await?;
            return Ok(transaction);
        }
        self.inner
            .transition(&mut transaction, TransactionState::Prepared)
            .await?;
        debug!("all participants prepared");

        self.inner
            .transition(&mut transaction, TransactionState::Committing)
            .await?;
        let acks = self
            .inner
            .call_all(&transaction, TransactionPhase::Commit, None)
            .await;
        let refusal = first_refusal(&acks);
        transaction.outcomes.extend(acks);
        match refusal {
            None => {
                self.inner
                    .transition(&mut transaction, TransactionState::Committed)
                    .await?;
                info!("transaction committed");
            }
            Some(reason) => {
                error!(
                    %reason,
                    "commit phase failed after a unanimous prepare; participants may be inconsistent"
                );
                transaction.failure = Some(reason);
                self.inner
                    .transition(&mut transaction, TransactionState::Failed)
                    .await?;
            }
        }
        self.inner.retire(transaction_id);
        Ok(transaction)
    }

    /// Tells every participant to abort and returns the final record.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::NotFound` for an unknown transaction and
    /// `TransactionError::InvalidState` once it is committing or terminal.
    #[instrument(skip(self))]
    pub async fn abort(
        &self,
        transaction_id: &str,
    ) -> Result<DistributedTransaction, TransactionError> {
        let (lock, _) = self.inner.entry(transaction_id, "abort").await?;
        let _guard = lock.lock().await;

        let mut transaction = self.status(transaction_id).await?;
        if !transaction.state.is_abortable() {
            return Err(TransactionError::InvalidState {
                transaction_id: transaction_id.to_owned(),
                state: transaction.state,
                operation: "abort",
            });
        }
        self.inner
            .abort_all(&mut transaction, "aborted by request".into())
            .await?;
        Ok(transaction)
    }

    /// Returns the current record of a transaction.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::NotFound` for an unknown transaction.
    pub async fn status(
        &self,
        transaction_id: &str,
    ) -> Result<DistributedTransaction, TransactionError> {
        self.inner
            .store
            .load(transaction_id)
            .await?
            .ok_or_else(|| TransactionError::NotFound(transaction_id.to_owned()))
    }

    /// Number of begun transactions still awaiting a decision.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Lists every known transaction.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError::Store` on backend failure.
    pub async fn list(&self) -> Result<Vec<DistributedTransaction>, TransactionError> {
        self.inner.store.list().await
    }
}

impl Inner {
    /// Looks up the coordination state of an undecided transaction. A
    /// decided or foreign transaction is reported as `InvalidState` for
    /// `operation`.
    async fn entry(
        &self,
        transaction_id: &str,
        operation: &'static str,
    ) -> Result<(Arc<tokio::sync::Mutex<()>>, Instant), TransactionError> {
        let found = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(transaction_id)
            .map(|e| (Arc::clone(&e.lock), e.deadline));
        match found {
            Some(entry) => Ok(entry),
            None => match self.store.load(transaction_id).await? {
                Some(transaction) => Err(TransactionError::InvalidState {
                    transaction_id: transaction_id.to_owned(),
                    state: transaction.state,
                    operation,
                }),
                None => Err(TransactionError::NotFound(transaction_id.to_owned())),
            },
        }
    }

    /// Called by the watchdog once the deadline passes.
    #[instrument(skip(self))]
    async fn expire(&self, transaction_id: &str) {
        let lock = match self.entry(transaction_id, "expire").await {
            Ok((lock, _)) => lock,
            Err(e) => {
                debug!(error = %e, "transaction already decided");
                return;
            }
        };
        let _guard = lock.lock().await;
        let mut transaction = match self.store.load(transaction_id).await {
            Ok(Some(transaction)) => transaction,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "watchdog could not load transaction");
                return;
            }
        };
        if !transaction.state.is_abortable() {
            debug!(state = %transaction.state, "watchdog fired after a decision; nothing to do");
            return;
        }
        warn!(timeout = ?transaction.timeout, "transaction timed out; aborting");
        if let Err(e) = self
            .abort_all(&mut transaction, "transaction timed out".into())
            .await
        {
            error!(error = %e, "watchdog abort failed");
        }
    }

    /// Sends `abort` to every participant and ends `Aborted`. Abort calls
    /// are best effort: failures are recorded, never retried.
    async fn abort_all(
        &self,
        transaction: &mut DistributedTransaction,
        reason: String,
    ) -> Result<(), TransactionError> {
        transaction.failure = Some(reason);
        self.transition(transaction, TransactionState::Aborting).await?;
        let acks = self.call_all(transaction, TransactionPhase::Abort, None).await;
        for ack in acks.iter().filter(|a| !a.acknowledged) {
            warn!(reason = %ack.describe_refusal(), "abort not acknowledged");
        }
        transaction.outcomes.extend(acks);
        self.transition(transaction, TransactionState::Aborted).await?;
        self.retire(&transaction.transaction_id);
        info!(
            transaction_id = %transaction.transaction_id,
            reason = transaction.failure.as_deref().unwrap_or_default(),
            "transaction aborted"
        );
        Ok(())
    }

    /// Calls every participant concurrently for `phase`. Each call is bounded
    /// by the per-call timeout and, when given, the transaction deadline.
    async fn call_all(
        &self,
        transaction: &DistributedTransaction,
        phase: TransactionPhase,
        deadline: Option<Instant>,
    ) -> Vec<ParticipantOutcome> {
        let calls = transaction.participants.iter().map(|participant| async move {
            let call_deadline = Instant::now() + self.call_timeout;
            let limit = deadline.map_or(call_deadline, |d| d.min(call_deadline));
            let call = async {
                match phase {
                    TransactionPhase::Prepare => {
                        self.client.prepare(participant, transaction).await
                    }
                    TransactionPhase::Commit => {
                        self.client.commit(participant, transaction).await
                    }
                    TransactionPhase::Abort => self.client.abort(participant, transaction).await,
                }
            };
            let budget = limit.saturating_duration_since(Instant::now());
            let result = timeout_at(limit, call)
                .await
                .unwrap_or(Err(ParticipantError::Timeout(budget)));
            let outcome = ParticipantOutcome {
                participant_id: participant.participant_id.clone(),
                phase,
                acknowledged: matches!(result, Ok(true)),
                error: result.err().map(|e| e.to_string()),
            };
            debug!(
                participant_id = %outcome.participant_id,
                %phase,
                acknowledged = outcome.acknowledged,
                "participant answered"
            );
            outcome
        });
        join_all(calls).await
    }

    async fn transition(
        &self,
        transaction: &mut DistributedTransaction,
        next: TransactionState,
    ) -> Result<(), TransactionError> {
        transaction.transition_to(next, self.clock.now())?;
        self.store.save(transaction).await
    }

    /// Drops the coordination state of a decided transaction and stops its
    /// watchdog.
    fn retire(&self, transaction_id: &str) {
        let retired = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(transaction_id);
        if let Some(entry) = retired {
            let _ = entry.watchdog.send(true);
        }
    }
}

fn first_refusal(outcomes: &[ParticipantOutcome]) -> Option<String> {
    outcomes
        .iter()
        .find(|o| !o.acknowledged)
        .map(ParticipantOutcome::describe_refusal)
}
