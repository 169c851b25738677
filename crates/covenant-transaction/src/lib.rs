//! Covenant Transaction — atomic commit across independent participants.
//!
//! [`DistributedTransactionCoordinator`] drives the two-phase commit
//! protocol: every participant must vote yes in the prepare phase before any
//! of them is told to commit. Participants are reached through a
//! [`ParticipantClient`] supplied by the application.

pub mod coordinator;
pub mod error;
pub mod participant;
pub mod store;
pub mod transaction;

pub use coordinator::DistributedTransactionCoordinator;
pub use error::{ParticipantError, TransactionError};
pub use participant::ParticipantClient;
pub use store::{InMemoryTransactionStore, TransactionStore};
pub use transaction::{
    DistributedTransaction, ParticipantOutcome, TransactionParticipant, TransactionPhase,
    TransactionState,
};
