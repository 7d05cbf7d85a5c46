//! Votes and recorded decisions.

use serde::{Deserialize, Serialize};

use crate::TransactionState;

/// A participant's answer to a prepare request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Vote {
    /// The participant has tentatively applied the transaction and can commit it.
    Commit,
    /// The participant refuses the transaction.
    Abort,
}

impl Vote {
    pub fn is_commit(&self) -> bool {
        matches!(self, Vote::Commit)
    }
}

/// Record kinds written to the decision log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    /// Prepare phase started; participants may hold tentative state.
    Preparing,
    /// Every participant voted to commit; the outcome is commit.
    Prepared,
    /// Commit acknowledged by all participants.
    Committed,
    /// Transaction rolled back.
    Aborted,
}

impl Decision {
    /// Terminal decisions finalize a transaction.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Decision::Committed | Decision::Aborted)
    }

    /// Transaction state implied by this record.
    pub fn state(&self) -> TransactionState {
        match self {
            Decision::Preparing => TransactionState::Preparing,
            Decision::Prepared => TransactionState::Prepared,
            Decision::Committed => TransactionState::Committed,
            Decision::Aborted => TransactionState::Aborted,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Preparing => "PREPARING",
            Decision::Prepared => "PREPARED",
            Decision::Committed => "COMMITTED",
            Decision::Aborted => "ABORTED",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_decisions() {
        assert!(Decision::Committed.is_terminal());
        assert!(Decision::Aborted.is_terminal());
        assert!(!Decision::Prepared.is_terminal());
        assert!(!Decision::Preparing.is_terminal());
    }

    #[test]
    fn test_decision_state() {
        assert_eq!(Decision::Prepared.state(), TransactionState::Prepared);
        assert_eq!(Decision::Aborted.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_vote_serde() {
        assert_eq!(serde_json::to_string(&Vote::Abort).unwrap(), "\"ABORT\"");
        assert!(Vote::Commit.is_commit());
    }
}
