//! Transaction state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle state of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    /// Created by `begin`, participants may still be enlisted.
    Initial,
    /// Prepare requests are in flight.
    Preparing,
    /// Every participant voted to commit.
    Prepared,
    /// Commit requests are in flight, or retries were exhausted.
    Committing,
    /// All participants acknowledged the commit.
    Committed,
    /// Rollback requests are in flight.
    Aborting,
    /// Rolled back.
    Aborted,
}

impl TransactionState {
    /// Check if this is a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }

    /// Check if the transaction is still in progress.
    pub fn is_in_progress(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether every participant has already voted to commit.
    ///
    /// Recovery drives such a transaction to `Committed`.
    pub fn is_decided_commit(&self) -> bool {
        matches!(
            self,
            TransactionState::Prepared | TransactionState::Committing | TransactionState::Committed
        )
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[TransactionState] {
        match self {
            TransactionState::Initial => {
                &[TransactionState::Preparing, TransactionState::Aborting]
            }
            TransactionState::Preparing => {
                &[TransactionState::Prepared, TransactionState::Aborting]
            }
            TransactionState::Prepared => {
                &[TransactionState::Committing, TransactionState::Aborting]
            }
            TransactionState::Committing => &[TransactionState::Committed],
            TransactionState::Aborting => &[TransactionState::Aborted],
            TransactionState::Committed => &[],
            TransactionState::Aborted => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: TransactionState) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Upper-case name as used in logs and the decision log.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Initial => "INITIAL",
            TransactionState::Preparing => "PREPARING",
            TransactionState::Prepared => "PREPARED",
            TransactionState::Committing => "COMMITTING",
            TransactionState::Committed => "COMMITTED",
            TransactionState::Aborting => "ABORTING",
            TransactionState::Aborted => "ABORTED",
        }
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error when attempting invalid state transition.
#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub from: TransactionState,
    pub to: TransactionState,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid state transition from {} to {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [TransactionState; 7] = [
        TransactionState::Initial,
        TransactionState::Preparing,
        TransactionState::Prepared,
        TransactionState::Committing,
        TransactionState::Committed,
        TransactionState::Aborting,
        TransactionState::Aborted,
    ];

    #[test]
    fn test_commit_path() {
        assert!(TransactionState::Initial.can_transition_to(TransactionState::Preparing));
        assert!(TransactionState::Preparing.can_transition_to(TransactionState::Prepared));
        assert!(TransactionState::Prepared.can_transition_to(TransactionState::Committing));
        assert!(TransactionState::Committing.can_transition_to(TransactionState::Committed));
    }

    #[test]
    fn test_committing_never_aborts() {
        assert!(!TransactionState::Committing.can_transition_to(TransactionState::Aborting));
        assert!(!TransactionState::Committing.can_transition_to(TransactionState::Aborted));
    }

    #[test]
    fn test_terminal_states() {
        assert!(TransactionState::Committed.is_terminal());
        assert!(TransactionState::Aborted.is_terminal());
        assert!(!TransactionState::Prepared.is_terminal());
        assert!(TransactionState::Committed.valid_transitions().is_empty());
        assert!(TransactionState::Aborted.valid_transitions().is_empty());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&TransactionState::Committing).unwrap();
        assert_eq!(json, "\"COMMITTING\"");
    }

    proptest! {
        // Any walk through the machine that reaches a terminal state stays there,
        // and never passes through both terminal states.
        #[test]
        fn prop_walks_end_in_one_terminal_state(choices in proptest::collection::vec(0usize..4, 0..12)) {
            let mut state = TransactionState::Initial;
            let mut seen_committed = false;
            let mut seen_aborted = false;
            for choice in choices {
                let next = state.valid_transitions();
                if next.is_empty() {
                    break;
                }
                state = next[choice % next.len()];
                seen_committed |= state == TransactionState::Committed;
                seen_aborted |= state == TransactionState::Aborted;
                prop_assert!(state != TransactionState::Preparing || !seen_committed && !seen_aborted);
            }
            prop_assert!(!(seen_committed && seen_aborted));
        }

        #[test]
        fn prop_transitions_reject_terminal_sources(to in 0usize..7, from in 0usize..7) {
            let from = ALL[from];
            let to = ALL[to];
            if from.is_terminal() {
                prop_assert!(!from.can_transition_to(to));
            }
        }
    }
}
