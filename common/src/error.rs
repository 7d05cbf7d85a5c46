//! Error types for the two-phase commit coordinator and its participants.

use std::time::Duration;

use crate::{Decision, ParticipantId, TransactionId, TransactionState};
use thiserror::Error;

/// Error returned by a participant call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParticipantError {
    /// Participant cannot be reached.
    #[error("Participant unavailable: {0}")]
    Unavailable(String),

    /// Participant refused the request.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// A resource lock could not be acquired in time.
    #[error("Lock on {resource} not acquired within {waited_ms}ms")]
    LockTimeout { resource: String, waited_ms: u64 },

    /// The call exceeded the coordinator's per-call budget.
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// Internal participant failure.
    #[error("Internal participant error: {0}")]
    Internal(String),
}

impl ParticipantError {
    /// Check if this error is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ParticipantError::Unavailable(_)
                | ParticipantError::Timeout(_)
                | ParticipantError::LockTimeout { .. }
                | ParticipantError::Internal(_)
        )
    }

    /// Get error code for logs and metrics labels.
    pub fn error_code(&self) -> &'static str {
        match self {
            ParticipantError::Unavailable(_) => "PARTICIPANT_UNAVAILABLE",
            ParticipantError::Rejected(_) => "REJECTED",
            ParticipantError::LockTimeout { .. } => "LOCK_TIMEOUT",
            ParticipantError::Timeout(_) => "TIMEOUT",
            ParticipantError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Result type alias for participant calls.
pub type ParticipantResult<T> = std::result::Result<T, ParticipantError>;

/// Main error type for coordinator operations.
#[derive(Error, Debug)]
pub enum TwoPhaseError {
    /// Operation on a transaction ID the coordinator has never seen.
    #[error("Unknown transaction: {0}")]
    UnknownTransaction(TransactionId),

    /// Operation not legal in the transaction's current state.
    #[error("Cannot {operation} transaction {tx_id} in state {state}")]
    InvalidState {
        tx_id: TransactionId,
        state: TransactionState,
        operation: &'static str,
    },

    /// Commit requested on a transaction that was rolled back.
    #[error("Transaction aborted: {0}")]
    TransactionAborted(TransactionId),

    /// A participant voted abort, failed or timed out during prepare.
    #[error("Participant {participant} failed to prepare {tx_id}: {source}")]
    ParticipantPrepareFailed {
        tx_id: TransactionId,
        participant: ParticipantId,
        source: ParticipantError,
    },

    /// A participant's commit failed after all retries.
    #[error("Participant {participant} failed to commit {tx_id} after {attempts} attempts: {source}")]
    ParticipantCommitFailed {
        tx_id: TransactionId,
        participant: ParticipantId,
        attempts: u32,
        source: ParticipantError,
    },

    /// A participant's rollback failed after all retries.
    #[error("Participant {participant} failed to roll back {tx_id}: {source}")]
    ParticipantRollbackFailed {
        tx_id: TransactionId,
        participant: ParticipantId,
        source: ParticipantError,
    },

    /// A different terminal decision is already recorded for this transaction.
    #[error("Conflicting decision for {tx_id}: {existing} already recorded, refused {attempted}")]
    ConflictingDecision {
        tx_id: TransactionId,
        existing: Decision,
        attempted: Decision,
    },

    /// Decision log could not be read or written.
    #[error("Decision log error: {0}")]
    DecisionLog(String),

    /// Participant ID not present in the registry.
    #[error("Unknown participant: {0}")]
    UnknownParticipant(ParticipantId),

    /// Coordinator is not accepting new transactions.
    #[error("Coordinator unavailable: {0}")]
    CoordinatorUnavailable(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl TwoPhaseError {
    /// Get error code for logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            TwoPhaseError::UnknownTransaction(_) => "UNKNOWN_TRANSACTION",
            TwoPhaseError::InvalidState { .. } => "INVALID_STATE",
            TwoPhaseError::TransactionAborted(_) => "TRANSACTION_ABORTED",
            TwoPhaseError::ParticipantPrepareFailed { .. } => "PARTICIPANT_PREPARE_FAILED",
            TwoPhaseError::ParticipantCommitFailed { .. } => "PARTICIPANT_COMMIT_FAILED",
            TwoPhaseError::ParticipantRollbackFailed { .. } => "PARTICIPANT_ROLLBACK_FAILED",
            TwoPhaseError::ConflictingDecision { .. } => "CONFLICTING_DECISION",
            TwoPhaseError::DecisionLog(_) => "DECISION_LOG_ERROR",
            TwoPhaseError::UnknownParticipant(_) => "UNKNOWN_PARTICIPANT",
            TwoPhaseError::CoordinatorUnavailable(_) => "COORDINATOR_UNAVAILABLE",
            TwoPhaseError::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }

    /// The participant a per-participant failure refers to.
    pub fn participant(&self) -> Option<&ParticipantId> {
        match self {
            TwoPhaseError::ParticipantPrepareFailed { participant, .. }
            | TwoPhaseError::ParticipantCommitFailed { participant, .. }
            | TwoPhaseError::ParticipantRollbackFailed { participant, .. } => Some(participant),
            TwoPhaseError::UnknownParticipant(participant) => Some(participant),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TwoPhaseError {
    fn from(e: std::io::Error) -> Self {
        TwoPhaseError::DecisionLog(e.to_string())
    }
}

/// Result type alias for coordinator operations.
pub type Result<T> = std::result::Result<T, TwoPhaseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_participant_errors() {
        assert!(ParticipantError::Unavailable("down".into()).is_retryable());
        assert!(ParticipantError::Timeout(Duration::from_millis(5)).is_retryable());
        assert!(!ParticipantError::Rejected("no".into()).is_retryable());
    }

    #[test]
    fn test_invalid_state_message() {
        let tx_id = TransactionId::new();
        let err = TwoPhaseError::InvalidState {
            tx_id,
            state: TransactionState::Prepared,
            operation: "enlist",
        };
        assert_eq!(
            err.to_string(),
            format!("Cannot enlist transaction {} in state PREPARED", tx_id)
        );
        assert_eq!(err.error_code(), "INVALID_STATE");
    }

    #[test]
    fn test_participant_accessor() {
        let err = TwoPhaseError::ParticipantRollbackFailed {
            tx_id: TransactionId::new(),
            participant: ParticipantId::new("A"),
            source: ParticipantError::Internal("boom".into()),
        };
        assert_eq!(err.participant(), Some(&ParticipantId::new("A")));
        assert!(TwoPhaseError::DecisionLog("x".into()).participant().is_none());
    }
}
