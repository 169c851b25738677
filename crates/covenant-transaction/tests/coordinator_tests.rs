//! Integration tests for the two-phase commit coordinator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use covenant_test_support::FixedClock;
use covenant_transaction::{
    DistributedTransaction, DistributedTransactionCoordinator, InMemoryTransactionStore,
    ParticipantClient, ParticipantError, TransactionError, TransactionParticipant,
    TransactionPhase, TransactionState,
};

/// How a scripted participant answers one phase.
#[derive(Clone, Copy)]
enum Reply {
    Yes,
    No,
    Unreachable,
    Hang,
}

#[derive(Default)]
struct ScriptedClient {
    replies: Mutex<HashMap<(String, TransactionPhase), Reply>>,
    calls: Mutex<Vec<(TransactionPhase, String)>>,
}

impl ScriptedClient {
    fn reply(&self, participant_id: &str, phase: TransactionPhase, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .insert((participant_id.to_owned(), phase), reply);
    }

    fn calls(&self, phase: TransactionPhase) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| *p == phase)
            .map(|(_, id)| id.clone())
            .collect()
    }

    async fn answer(
        &self,
        participant: &TransactionParticipant,
        phase: TransactionPhase,
    ) -> Result<bool, ParticipantError> {
        self.calls
            .lock()
            .unwrap()
            .push((phase, participant.participant_id.clone()));
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(&(participant.participant_id.clone(), phase))
            .copied()
            .unwrap_or(Reply::Yes);
        match reply {
            Reply::Yes => Ok(true),
            Reply::No => Ok(false),
            Reply::Unreachable => Err(ParticipantError::Transport("connection refused".into())),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl ParticipantClient for ScriptedClient {
    async fn prepare(
        &self,
        participant: &TransactionParticipant,
        _transaction: &DistributedTransaction,
    ) -> Result<bool, ParticipantError> {
        self.answer(participant, TransactionPhase::Prepare).await
    }

    async fn commit(
        &self,
        participant: &TransactionParticipant,
        _transaction: &DistributedTransaction,
    ) -> Result<bool, ParticipantError> {
        self.answer(participant, TransactionPhase::Commit).await
    }

    async fn abort(
        &self,
        participant: &TransactionParticipant,
        _transaction: &DistributedTransaction,
    ) -> Result<bool, ParticipantError> {
        self.answer(participant, TransactionPhase::Abort).await
    }
}

fn coordinator(client: &Arc<ScriptedClient>, call_timeout: Duration) -> DistributedTransactionCoordinator {
    DistributedTransactionCoordinator::new(
        Arc::clone(client) as Arc<dyn ParticipantClient>,
        Arc::new(InMemoryTransactionStore::new()),
        Arc::new(FixedClock(
            Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap(),
        )),
        call_timeout,
    )
}

fn transaction(ids: &[&str], timeout: Duration) -> DistributedTransaction {
    let participants = ids
        .iter()
        .map(|id| TransactionParticipant::new(*id, format!("grpc://{id}:7000"), "postgres"))
        .collect();
    DistributedTransaction::new(
        participants,
        timeout,
        Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap(),
    )
}

#[tokio::test]
async fn test_two_participants_commit() {
    // Arrange
    let client = Arc::new(ScriptedClient::default());
    let coordinator = coordinator(&client, Duration::from_secs(1));
    let id = coordinator
        .begin(transaction(&["orders", "billing"], Duration::from_secs(10)))
        .await
        .unwrap();

    // Act
    let finished = coordinator.commit(&id).await.unwrap();

    // Assert
    assert_eq!(finished.state, TransactionState::Committed);
    assert!(finished.failure.is_none());
    assert_eq!(client.calls(TransactionPhase::Prepare).len(), 2);
    assert_eq!(client.calls(TransactionPhase::Commit).len(), 2);
    assert_eq!(finished.outcomes_for(TransactionPhase::Commit).count(), 2);
    assert_eq!(coordinator.status(&id).await.unwrap(), finished);
}

#[tokio::test]
async fn test_one_failed_prepare_aborts_everyone_and_commits_no_one() {
    // Arrange
    let client = Arc::new(ScriptedClient::default());
    client.reply("p2", TransactionPhase::Prepare, Reply::Unreachable);
    let coordinator = coordinator(&client, Duration::from_secs(1));
    let id = coordinator
        .begin(transaction(&["p1", "p2", "p3"], Duration::from_secs(10)))
        .await
        .unwrap();

    // Act
    let finished = coordinator.commit(&id).await.unwrap();

    // Assert
    assert_eq!(finished.state, TransactionState::Aborted);
    assert!(client.calls(TransactionPhase::Commit).is_empty());
    let mut aborted = client.calls(TransactionPhase::Abort);
    aborted.sort();
    assert_eq!(aborted, vec!["p1", "p2", "p3"]);
    assert!(finished.failure.unwrap().contains("p2"));
}

#[tokio::test]
async fn test_a_no_vote_aborts_the_transaction() {
    // Arrange
    let client = Arc::new(ScriptedClient::default());
    client.reply("billing", TransactionPhase::Prepare, Reply::No);
    let coordinator = coordinator(&client, Duration::from_secs(1));
    let id = coordinator
        .begin(transaction(&["orders", "billing"], Duration::from_secs(10)))
        .await
        .unwrap();

    // Act
    let finished = coordinator.commit(&id).await.unwrap();

    // Assert
    assert_eq!(finished.state, TransactionState::Aborted);
    assert_eq!(
        finished.failure.as_deref(),
        Some("participant billing refused to prepare")
    );
    assert!(client.calls(TransactionPhase::Commit).is_empty());
}

#[tokio::test]
async fn test_slow_prepare_hits_the_call_timeout_and_aborts() {
    // Arrange
    let client = Arc::new(ScriptedClient::default());
    client.reply("billing", TransactionPhase::Prepare, Reply::Hang);
    let coordinator = coordinator(&client, Duration::from_millis(30));
    let id = coordinator
        .begin(transaction(&["orders", "billing"], Duration::from_secs(10)))
        .await
        .unwrap();

    // Act
    let finished = tokio::time::timeout(Duration::from_secs(2), coordinator.commit(&id))
        .await
        .expect("prepare was not bounded by the call timeout")
        .unwrap();

    // Assert
    assert_eq!(finished.state, TransactionState::Aborted);
    assert!(finished.failure.unwrap().contains("timed out"));
    assert!(client.calls(TransactionPhase::Commit).is_empty());
}

#[tokio::test]
async fn test_commit_failure_after_prepare_ends_failed() {
    // Arrange
    let client = Arc::new(ScriptedClient::default());
    client.reply("billing", TransactionPhase::Commit, Reply::Unreachable);
    let coordinator = coordinator(&client, Duration::from_secs(1));
    let id = coordinator
        .begin(transaction(&["orders", "billing"], Duration::from_secs(10)))
        .await
        .unwrap();

    // Act
    let finished = coordinator.commit(&id).await.unwrap();

    // Assert
    assert_eq!(finished.state, TransactionState::Failed);
    assert!(client.calls(TransactionPhase::Abort).is_empty());
    assert_eq!(
        finished.failure.as_deref(),
        Some("participant billing failed to commit: transport error: connection refused")
    );
}

#[tokio::test]
async fn test_watchdog_aborts_an_undecided_transaction() {
    // Arrange
    let client = Arc::new(ScriptedClient::default());
    let coordinator = coordinator(&client, Duration::from_secs(1));
    let id = coordinator
        .begin(transaction(&["orders", "billing"], Duration::from_millis(30)))
        .await
        .unwrap();

    // Act
    let finished = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let current = coordinator.status(&id).await.unwrap();
            if current.state.is_terminal() {
                break current;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("watchdog never fired");

    // Assert
    assert_eq!(finished.state, TransactionState::Aborted);
    assert_eq!(finished.failure.as_deref(), Some("transaction timed out"));
    assert_eq!(client.calls(TransactionPhase::Abort).len(), 2);
    assert!(matches!(
        coordinator.commit(&id).await,
        Err(TransactionError::InvalidState { operation: "commit", .. })
    ));
}

#[tokio::test]
async fn test_watchdog_is_disarmed_after_commit() {
    // Arrange
    let client = Arc::new(ScriptedClient::default());
    let coordinator = coordinator(&client, Duration::from_secs(1));
    let id = coordinator
        .begin(transaction(&["orders"], Duration::from_millis(20)))
        .await
        .unwrap();
    coordinator.commit(&id).await.unwrap();

    // Act
    tokio::time::sleep(Duration::from_millis(60)).await;

    // Assert
    assert_eq!(
        coordinator.status(&id).await.unwrap().state,
        TransactionState::Committed
    );
    assert!(client.calls(TransactionPhase::Abort).is_empty());
}

#[tokio::test]
async fn test_explicit_abort_reaches_every_participant_even_if_one_fails() {
    // Arrange
    let client = Arc::new(ScriptedClient::default());
    client.reply("orders", TransactionPhase::Abort, Reply::Unreachable);
    let coordinator = coordinator(&client, Duration::from_secs(1));
    let id = coordinator
        .begin(transaction(&["orders", "billing"], Duration::from_secs(10)))
        .await
        .unwrap();

    // Act
    let finished = coordinator.abort(&id).await.unwrap();

    // Assert
    assert_eq!(finished.state, TransactionState::Aborted);
    assert_eq!(client.calls(TransactionPhase::Abort).len(), 2);
    assert_eq!(
        finished
            .outcomes_for(TransactionPhase::Abort)
            .filter(|o| !o.acknowledged)
            .count(),
        1
    );
}

#[tokio::test]
async fn test_abort_of_a_committed_transaction_is_rejected() {
    // Arrange
    let client = Arc::new(ScriptedClient::default());
    let coordinator = coordinator(&client, Duration::from_secs(1));
    let id = coordinator
        .begin(transaction(&["orders"], Duration::from_secs(10)))
        .await
        .unwrap();
    coordinator.commit(&id).await.unwrap();

    // Act
    let result = coordinator.abort(&id).await;

    // Assert
    assert!(matches!(
        result,
        Err(TransactionError::InvalidState {
            state: TransactionState::Committed,
            operation: "abort",
            ..
        })
    ));
}

#[tokio::test]
async fn test_begin_rejects_invalid_transactions() {
    let client = Arc::new(ScriptedClient::default());
    let coordinator = coordinator(&client, Duration::from_secs(1));

    let empty = coordinator
        .begin(transaction(&[], Duration::from_secs(1)))
        .await;
    let duplicate = coordinator
        .begin(transaction(&["a", "a"], Duration::from_secs(1)))
        .await;

    assert!(matches!(empty, Err(TransactionError::Validation(_))));
    assert!(matches!(duplicate, Err(TransactionError::Validation(_))));
    assert!(coordinator.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_transaction_is_not_found() {
    let client = Arc::new(ScriptedClient::default());
    let coordinator = coordinator(&client, Duration::from_secs(1));

    let result = coordinator.commit("missing").await;

    assert_eq!(
        result.unwrap_err(),
        TransactionError::NotFound("missing".into())
    );
}

#[tokio::test]
async fn test_decided_transactions_release_their_coordination_state() {
    // Arrange
    let client = Arc::new(ScriptedClient::default());
    client.reply("billing", TransactionPhase::Prepare, Reply::No);
    let coordinator = coordinator(&client, Duration::from_secs(1));
    let committed = coordinator
        .begin(transaction(&["orders"], Duration::from_secs(10)))
        .await
        .unwrap();
    let refused = coordinator
        .begin(transaction(&["orders", "billing"], Duration::from_secs(10)))
        .await
        .unwrap();
    let aborted = coordinator
        .begin(transaction(&["orders"], Duration::from_secs(10)))
        .await
        .unwrap();
    let expiring = coordinator
        .begin(transaction(&["orders"], Duration::from_millis(20)))
        .await
        .unwrap();
    assert_eq!(coordinator.in_flight(), 4);

    // Act
    coordinator.commit(&committed).await.unwrap();
    coordinator.commit(&refused).await.unwrap();
    coordinator.abort(&aborted).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Assert
    assert_eq!(coordinator.in_flight(), 0);
    assert_eq!(
        coordinator.status(&expiring).await.unwrap().state,
        TransactionState::Aborted
    );
    assert!(matches!(
        coordinator.commit(&committed).await,
        Err(TransactionError::InvalidState {
            state: TransactionState::Committed,
            operation: "commit",
            ..
        })
    ));
}

#[tokio::test]
async fn test_concurrent_begins_with_one_id_admit_exactly_one() {
    // Arrange
    let client = Arc::new(ScriptedClient::default());
    let coordinator = coordinator(&client, Duration::from_secs(1));
    let definition = transaction(&["orders"], Duration::from_secs(10)).with_id("tx-7");

    // Act
    let (first, second) = tokio::join!(
        coordinator.begin(definition.clone()),
        coordinator.begin(definition.clone()),
    );

    // Assert
    assert_eq!(
        usize::from(first.is_ok()) + usize::from(second.is_ok()),
        1
    );
    assert_eq!(coordinator.in_flight(), 1);
    assert_eq!(coordinator.list().await.unwrap().len(), 1);
}
