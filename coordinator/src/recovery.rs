//! Restart recovery.
//!
//! Transactions that every participant prepared are committed; any other
//! unfinished transaction is rolled back. Candidates come from the live
//! table and from log records left by a previous process, whose
//! participants are looked up in the registry.

use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use twophase_common::{Decision, Result, TransactionId, TransactionState, TwoPhaseError};

use crate::context::TransactionContext;
use crate::coordinator::{TransactionCoordinator, TransactionEntry};
use crate::state::CoordinatorState;

/// What recovery did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Transactions driven to `Committed`.
    pub committed: Vec<TransactionId>,
    /// Transactions rolled back.
    pub aborted: Vec<TransactionId>,
    /// Transactions left `Committing` because a participant never acknowledged.
    pub incomplete: Vec<TransactionId>,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.committed.len() + self.aborted.len() + self.incomplete.len()
    }
}

impl TransactionCoordinator {
    /// Finish every transaction left undecided.
    #[instrument(skip(self), fields(node_id = %self.node_id()))]
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let previous = self.state();
        if matches!(
            previous,
            CoordinatorState::ShuttingDown | CoordinatorState::Stopped
        ) {
            return Err(TwoPhaseError::CoordinatorUnavailable(format!(
                "cannot recover while {previous:?}"
            )));
        }

        self.set_state(CoordinatorState::Recovering);
        let report = self.recover_transactions().await;
        self.set_state(previous);

        info!(
            committed = report.committed.len(),
            aborted = report.aborted.len(),
            incomplete = report.incomplete.len(),
            "Recovery complete"
        );
        Ok(report)
    }

    async fn recover_transactions(&self) -> RecoveryReport {
        self.restore_from_log();

        let candidates: Vec<Arc<TransactionEntry>> = self
            .transactions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut report = RecoveryReport::default();
        for entry in candidates {
            let _phase = entry.phase.lock().await;
            let (tx_id, state) = {
                let context = entry.context.lock();
                (context.id(), context.state())
            };

            if state.is_terminal() {
                continue;
            }

            if state.is_decided_commit() {
                info!(tx_id = %tx_id, state = %state, "Recovering prepared transaction");
                match self.resume_commit(&entry).await {
                    Ok(true) => {
                        self.metrics.recovered_commit();
                        report.committed.push(tx_id);
                    }
                    Ok(false) => report.incomplete.push(tx_id),
                    Err(e) => {
                        error!(tx_id = %tx_id, error = %e, "Recovery commit failed");
                        report.incomplete.push(tx_id);
                    }
                }
            } else {
                info!(tx_id = %tx_id, state = %state, "Rolling back unprepared transaction");
                match self.abort_locked(&entry).await {
                    Ok(()) => {
                        self.metrics.recovered_abort();
                        report.aborted.push(tx_id);
                    }
                    Err(e) => {
                        error!(tx_id = %tx_id, error = %e, "Recovery rollback failed");
                        report.incomplete.push(tx_id);
                    }
                }
            }
        }

        report
    }

    async fn resume_commit(&self, entry: &TransactionEntry) -> Result<bool> {
        {
            let mut context = entry.context.lock();
            if context.state() == TransactionState::Prepared {
                let tx_id = context.id();
                context
                    .transition_to(TransactionState::Committing)
                    .map_err(|e| TwoPhaseError::InvalidState {
                        tx_id,
                        state: e.from,
                        operation: "recover",
                    })?;
            }
        }
        self.commit_locked(entry).await
    }

    /// Add log-only undecided transactions to the live table.
    fn restore_from_log(&self) {
        for record in self.decision_log.pending() {
            if self.transactions.contains_key(&record.tx_id) {
                continue;
            }

            let (participants, unresolved) = self.registry.resolve(&record.participant_ids);
            for participant_id in &unresolved {
                warn!(
                    tx_id = %record.tx_id,
                    participant_id = %participant_id,
                    "Logged participant is not registered"
                );
            }

            let state = match record.outcome {
                Decision::Prepared => TransactionState::Prepared,
                _ => TransactionState::Preparing,
            };
            info!(
                tx_id = %record.tx_id,
                outcome = %record.outcome,
                participants = record.participant_ids.len(),
                "Restored transaction from decision log"
            );

            let context = TransactionContext::restored(record.tx_id, state, participants, unresolved);
            self.transactions
                .insert(record.tx_id, Arc::new(TransactionEntry::new(context)));
        }
    }
}
