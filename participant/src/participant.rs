//! The participant capability set consumed by the coordinator.

use std::sync::Arc;

use twophase_common::{ParticipantId, ParticipantResult, TransactionId, Vote};

/// A resource manager taking part in two-phase commit.
///
/// Implementations carry the business semantics (debit an account, reserve
/// stock); the coordinator only sees votes and results keyed by transaction ID.
///
/// Contract:
/// - `prepare` may only apply reversible, tentative changes.
/// - `commit` and `rollback` can be called more than once for the same
///   transaction, since the coordinator retries them and recovery may repeat them.
/// - A participant that guards a shared resource should bound its own lock
///   wait and fail `prepare` with [`ParticipantError::LockTimeout`] rather than
///   block past the coordinator's per-call budget.
///
/// [`ParticipantError::LockTimeout`]: twophase_common::ParticipantError::LockTimeout
#[async_trait::async_trait]
pub trait Participant: Send + Sync {
    /// Stable identifier, used for deduplication, logging and recovery.
    fn id(&self) -> &ParticipantId;

    /// Phase one: tentatively apply the transaction and vote.
    async fn prepare(&self, tx_id: TransactionId) -> ParticipantResult<Vote>;

    /// Phase two: make the prepared changes durable.
    async fn commit(&self, tx_id: TransactionId) -> ParticipantResult<()>;

    /// Phase two: discard any tentative changes.
    async fn rollback(&self, tx_id: TransactionId) -> ParticipantResult<()>;
}

/// Participants are shared between the caller, the coordinator and its registry.
pub type SharedParticipant = Arc<dyn Participant>;

/// Participant that votes commit and logs every call.
///
/// Useful as a placeholder when a transaction needs a branch with no local work.
pub struct LoggingParticipant {
    id: ParticipantId,
}

impl LoggingParticipant {
    pub fn new(id: impl Into<ParticipantId>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait::async_trait]
impl Participant for LoggingParticipant {
    fn id(&self) -> &ParticipantId {
        &self.id
    }

    async fn prepare(&self, tx_id: TransactionId) -> ParticipantResult<Vote> {
        tracing::info!(participant_id = %self.id, tx_id = %tx_id, "Prepare received");
        Ok(Vote::Commit)
    }

    async fn commit(&self, tx_id: TransactionId) -> ParticipantResult<()> {
        tracing::info!(participant_id = %self.id, tx_id = %tx_id, "Commit received");
        Ok(())
    }

    async fn rollback(&self, tx_id: TransactionId) -> ParticipantResult<()> {
        tracing::info!(participant_id = %self.id, tx_id = %tx_id, "Rollback received");
        Ok(())
    }
}
