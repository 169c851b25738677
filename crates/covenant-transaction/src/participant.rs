//! The participant transport boundary.

use async_trait::async_trait;

use crate::error::ParticipantError;
use crate::transaction::{DistributedTransaction, TransactionParticipant};

/// Reaches a participant's resource manager.
///
/// Every call must be idempotent: the coordinator may repeat an abort, and a
/// participant may see an abort for a transaction it never prepared.
/// `Ok(true)` is a yes vote or acknowledgement; `Ok(false)` is an explicit
/// refusal.
#[async_trait]
pub trait ParticipantClient: Send + Sync {
    /// Asks the participant to make its part durable and vote.
    async fn prepare(
        &self,
        participant: &TransactionParticipant,
        transaction: &DistributedTransaction,
    ) -> Result<bool, ParticipantError>;

    /// Tells a prepared participant to commit.
    async fn commit(
        &self,
        participant: &TransactionParticipant,
        transaction: &DistributedTransaction,
    ) -> Result<bool, ParticipantError>;

    /// Tells the participant to discard its part.
    async fn abort(
        &self,
        participant: &TransactionParticipant,
        transaction: &DistributedTransaction,
    ) -> Result<bool, ParticipantError>;
}
