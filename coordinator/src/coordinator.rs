//! Core coordinator implementation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{error, info, instrument, warn};

use twophase_common::{
    Decision, ParticipantId, Result, TransactionId, TransactionState, TwoPhaseError,
};
use twophase_participant::SharedParticipant;

use crate::config::CoordinatorConfig;
use crate::context::TransactionContext;
use crate::decision_log::{DecisionLog, DecisionLogEntry, FileDecisionLog, MemoryDecisionLog};
use crate::fanout::FanOut;
use crate::metrics::{Metrics, SharedMetrics};
use crate::registry::ParticipantRegistry;
use crate::state::CoordinatorState;

/// A live transaction.
///
/// `context` is only locked briefly so state reads never wait on a phase.
/// `phase` serializes prepare, commit, rollback and recovery for one
/// transaction and is held across participant calls.
pub(crate) struct TransactionEntry {
    pub(crate) context: Mutex<TransactionContext>,
    pub(crate) phase: tokio::sync::Mutex<()>,
}

impl TransactionEntry {
    pub(crate) fn new(context: TransactionContext) -> Self {
        Self {
            context: Mutex::new(context),
            phase: tokio::sync::Mutex::new(()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    Prepare,
    Commit,
    Rollback,
}

impl Operation {
    fn as_str(self) -> &'static str {
        match self {
            Operation::Prepare => "prepare",
            Operation::Commit => "commit",
            Operation::Rollback => "rollback",
        }
    }
}

/// Counts a running phase for the lifetime of the guard.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Drives transactions through two-phase commit.
pub struct TransactionCoordinator {
    /// Configuration.
    config: CoordinatorConfig,
    /// Node ID for this coordinator instance.
    node_id: String,
    /// Current coordinator state.
    state: Arc<RwLock<CoordinatorState>>,
    /// Live transactions indexed by ID.
    pub(crate) transactions: Arc<DashMap<TransactionId, Arc<TransactionEntry>>>,
    pub(crate) decision_log: Arc<dyn DecisionLog>,
    pub(crate) registry: Arc<ParticipantRegistry>,
    fan_out: FanOut,
    pub(crate) metrics: SharedMetrics,
    /// Prepare, commit and rollback calls currently running.
    in_flight: Arc<AtomicUsize>,
}

impl TransactionCoordinator {
    /// Create a coordinator over `decision_log` with an empty participant registry.
    pub fn new(config: CoordinatorConfig, decision_log: Arc<dyn DecisionLog>) -> Self {
        Self::with_registry(config, decision_log, Arc::new(ParticipantRegistry::new()))
    }

    /// Create a coordinator that resolves logged participant IDs through `registry`.
    pub fn with_registry(
        config: CoordinatorConfig,
        decision_log: Arc<dyn DecisionLog>,
        registry: Arc<ParticipantRegistry>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let fan_out = FanOut::new(
            config.prepare_timeout,
            config.commit_retry.clone(),
            config.rollback_retry.clone(),
            metrics.clone(),
        );
        let node_id = config.node_id.clone().unwrap_or_else(|| {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("coordinator-{}", &suffix[..8])
        });

        Self {
            config,
            node_id,
            state: Arc::new(RwLock::new(CoordinatorState::Starting)),
            transactions: Arc::new(DashMap::new()),
            decision_log,
            registry,
            fan_out,
            metrics,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Validate `config` and open the decision log it names.
    ///
    /// Without a `decision_log_path` decisions are kept in memory.
    pub fn open(config: CoordinatorConfig, registry: Arc<ParticipantRegistry>) -> Result<Self> {
        config.validate()?;

        let decision_log: Arc<dyn DecisionLog> = match &config.decision_log_path {
            Some(path) => Arc::new(FileDecisionLog::open(path)?),
            None => Arc::new(MemoryDecisionLog::new()),
        };

        Ok(Self::with_registry(config, decision_log, registry))
    }

    /// Run recovery and start accepting transactions.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn start(&self) -> Result<crate::recovery::RecoveryReport> {
        info!("Starting coordinator");

        let report = self.recover().await?;
        self.set_state(CoordinatorState::Running);

        info!(
            committed = report.committed.len(),
            aborted = report.aborted.len(),
            incomplete = report.incomplete.len(),
            "Coordinator started successfully"
        );
        Ok(report)
    }

    /// Stop accepting transactions and wait for running phases.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping coordinator");

        self.set_state(CoordinatorState::ShuttingDown);
        self.drain_in_flight().await;
        self.set_state(CoordinatorState::Stopped);

        info!("Coordinator stopped");
        Ok(())
    }

    /// Create a transaction in `Initial`.
    pub fn begin(&self) -> Result<TransactionId> {
        let state = self.state();
        if !state.accepts_requests() {
            return Err(TwoPhaseError::CoordinatorUnavailable(format!(
                "coordinator is {state:?}"
            )));
        }

        let tx_id = TransactionId::new();
        self.transactions.insert(
            tx_id,
            Arc::new(TransactionEntry::new(TransactionContext::new(tx_id))),
        );
        self.metrics.transaction_begun();

        info!(tx_id = %tx_id, "Transaction started");
        Ok(tx_id)
    }

    /// Add a participant to a transaction still in `Initial`.
    ///
    /// Enlisting a participant whose ID is already enlisted is a no-op.
    pub fn enlist(&self, tx_id: TransactionId, participant: SharedParticipant) -> Result<()> {
        let entry = match self.entry(&tx_id) {
            Some(entry) => entry,
            None => {
                return Err(match self.decision_log.decision(&tx_id) {
                    Some(decision) => TwoPhaseError::InvalidState {
                        tx_id,
                        state: decision.state(),
                        operation: "enlist",
                    },
                    None => TwoPhaseError::UnknownTransaction(tx_id),
                })
            }
        };

        let participant_id = participant.id().clone();
        let added = entry.context.lock().enlist(participant)?;
        if added {
            info!(tx_id = %tx_id, participant_id = %participant_id, "Participant enlisted");
        }
        Ok(())
    }

    /// Run the prepare phase. Returns whether every participant voted commit.
    ///
    /// A negative outcome has already rolled the transaction back.
    #[instrument(skip(self), fields(tx_id = %tx_id))]
    pub async fn prepare(&self, tx_id: TransactionId) -> Result<bool> {
        let Some(entry) = self.entry(&tx_id) else {
            return self.settled(tx_id, Operation::Prepare);
        };
        let _in_flight = self.track()?;
        let _phase = entry.phase.lock().await;

        let state = entry.context.lock().state();
        match state {
            TransactionState::Initial => self.prepare_locked(&entry).await,
            TransactionState::Prepared
            | TransactionState::Committing
            | TransactionState::Committed => Ok(true),
            TransactionState::Aborted => Ok(false),
            // Left behind by an interrupted phase.
            TransactionState::Preparing | TransactionState::Aborting => {
                self.abort_locked(&entry).await?;
                Ok(false)
            }
        }
    }

    /// Run the commit phase of a prepared transaction.
    ///
    /// Returns `false` when some participant never acknowledged; the
    /// transaction then stays `Committing` and a later call resumes it.
    #[instrument(skip(self), fields(tx_id = %tx_id))]
    pub async fn commit(&self, tx_id: TransactionId) -> Result<bool> {
        let Some(entry) = self.entry(&tx_id) else {
            return self.settled(tx_id, Operation::Commit);
        };
        let _in_flight = self.track()?;
        let _phase = entry.phase.lock().await;

        let state = entry.context.lock().state();
        match state {
            TransactionState::Initial | TransactionState::Preparing => {
                Err(TwoPhaseError::InvalidState {
                    tx_id,
                    state,
                    operation: "commit",
                })
            }
            TransactionState::Aborting | TransactionState::Aborted => {
                Err(TwoPhaseError::TransactionAborted(tx_id))
            }
            TransactionState::Committed => Ok(true),
            TransactionState::Prepared => {
                transition(&mut entry.context.lock(), TransactionState::Committing, "commit")?;
                self.commit_locked(&entry).await
            }
            TransactionState::Committing => self.commit_locked(&entry).await,
        }
    }

    /// Roll a transaction back. Participant failures are logged, not returned.
    #[instrument(skip(self), fields(tx_id = %tx_id))]
    pub async fn rollback(&self, tx_id: TransactionId) -> Result<bool> {
        let Some(entry) = self.entry(&tx_id) else {
            return self.settled(tx_id, Operation::Rollback);
        };
        let _in_flight = self.track()?;
        let _phase = entry.phase.lock().await;

        let state = entry.context.lock().state();
        match state {
            TransactionState::Committing | TransactionState::Committed => {
                Err(TwoPhaseError::InvalidState {
                    tx_id,
                    state,
                    operation: "rollback",
                })
            }
            TransactionState::Aborted => Ok(true),
            TransactionState::Initial
            | TransactionState::Preparing
            | TransactionState::Prepared
            | TransactionState::Aborting => {
                self.abort_locked(&entry).await?;
                Ok(true)
            }
        }
    }

    /// Current state of a transaction, live or recorded.
    pub fn get_state(&self, tx_id: TransactionId) -> Result<TransactionState> {
        if let Some(entry) = self.entry(&tx_id) {
            return Ok(entry.context.lock().state());
        }

        self.decision_log
            .decision(&tx_id)
            .map(|decision| decision.state())
            .ok_or(TwoPhaseError::UnknownTransaction(tx_id))
    }

    /// Participant IDs enlisted in a live transaction.
    pub fn participants(&self, tx_id: TransactionId) -> Result<Vec<ParticipantId>> {
        self.entry(&tx_id)
            .map(|entry| entry.context.lock().participant_ids())
            .ok_or(TwoPhaseError::UnknownTransaction(tx_id))
    }

    /// Get the current coordinator state.
    pub fn state(&self) -> CoordinatorState {
        *self.state.read()
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    pub fn registry(&self) -> &Arc<ParticipantRegistry> {
        &self.registry
    }

    pub fn decision_log(&self) -> &Arc<dyn DecisionLog> {
        &self.decision_log
    }

    /// Number of live transactions that have not reached a terminal state.
    pub fn active_transaction_count(&self) -> usize {
        self.transactions
            .iter()
            .filter(|entry| entry.context.lock().state().is_in_progress())
            .count()
    }

    /// Number of transactions held in the live table, terminal ones included.
    pub fn live_transaction_count(&self) -> usize {
        self.transactions.len()
    }

    // --- Phase bodies, called with the transaction's phase lock held ---

    async fn prepare_locked(&self, entry: &TransactionEntry) -> Result<bool> {
        let (tx_id, participants, participant_ids) = {
            let mut context = entry.context.lock();
            transition(&mut context, TransactionState::Preparing, "prepare")?;
            (
                context.id(),
                context.participants().to_vec(),
                context.participant_ids(),
            )
        };

        if let Err(e) = self.record(tx_id, Decision::Preparing, participant_ids.clone()).await {
            self.abort_after_log_failure(entry).await;
            return Err(e);
        }

        info!(participants = participants.len(), "Prepare phase started");
        let outcome = self.fan_out.prepare_all(tx_id, &participants).await;

        if !outcome.is_unanimous() {
            let failures = outcome.failures(tx_id);
            info!(
                rejected = failures.len(),
                first_failure = failures.first().and_then(|e| e.participant()).map(|p| p.as_str()),
                "Prepare rejected, rolling back"
            );
            self.abort_locked(entry).await?;
            return Ok(false);
        }

        if let Err(e) = self.record(tx_id, Decision::Prepared, participant_ids).await {
            self.abort_after_log_failure(entry).await;
            return Err(e);
        }

        transition(&mut entry.context.lock(), TransactionState::Prepared, "prepare")?;
        info!("All participants prepared");
        Ok(true)
    }

    pub(crate) async fn commit_locked(&self, entry: &TransactionEntry) -> Result<bool> {
        let (tx_id, pending) = {
            let context = entry.context.lock();
            (context.id(), context.pending_commit())
        };

        info!(pending = pending.len(), "Commit phase started");
        let outcome = self.fan_out.commit_all(tx_id, &pending).await;

        let (complete, unresolved) = {
            let mut context = entry.context.lock();
            for participant_id in outcome.acknowledged {
                context.mark_committed(participant_id);
            }
            (context.is_commit_complete(), context.unresolved().to_vec())
        };

        if !complete {
            self.metrics.commit_failed();
            for participant_id in &unresolved {
                error!(participant_id = %participant_id, "Participant not registered, cannot commit");
            }
            error!(
                failed = outcome.failures.len(),
                unresolved = unresolved.len(),
                "Commit incomplete, transaction left COMMITTING"
            );
            return Ok(false);
        }

        self.finalize(entry, Decision::Committed).await?;
        Ok(true)
    }

    pub(crate) async fn abort_locked(&self, entry: &TransactionEntry) -> Result<()> {
        let (tx_id, participants, unresolved) = {
            let mut context = entry.context.lock();
            if context.state() != TransactionState::Aborting {
                transition(&mut context, TransactionState::Aborting, "rollback")?;
            }
            (
                context.id(),
                context.participants().to_vec(),
                context.unresolved().to_vec(),
            )
        };

        for participant_id in &unresolved {
            warn!(participant_id = %participant_id, "Participant not registered, skipping rollback");
        }

        info!(participants = participants.len(), "Rollback phase started");
        let outcome = self.fan_out.rollback_all(tx_id, &participants).await;
        if !outcome.is_complete() {
            warn!(
                failed = outcome.failures.len(),
                "Rollback finished with participant failures"
            );
        }

        self.finalize(entry, Decision::Aborted).await
    }

    /// Roll back after the decision log refused a record, keeping the original error.
    async fn abort_after_log_failure(&self, entry: &TransactionEntry) {
        if let Err(e) = self.abort_locked(entry).await {
            error!(error = %e, "Rollback after decision log failure could not be recorded");
        }
    }

    /// Record a terminal decision and move the context to the matching state.
    async fn finalize(&self, entry: &TransactionEntry, decision: Decision) -> Result<()> {
        let (tx_id, participant_ids) = {
            let context = entry.context.lock();
            (context.id(), context.participant_ids())
        };

        self.record(tx_id, decision, participant_ids).await?;
        transition(&mut entry.context.lock(), decision.state(), decision.as_str())?;

        match decision {
            Decision::Committed => self.metrics.transaction_committed(),
            Decision::Aborted => self.metrics.transaction_aborted(),
            Decision::Preparing | Decision::Prepared => {}
        }
        info!(tx_id = %tx_id, outcome = %decision, "Transaction finalized");

        if self.config.evict_terminal {
            self.transactions.remove(&tx_id);
        }
        Ok(())
    }

    /// Append a decision on the blocking pool; file logs sync on every write.
    async fn record(
        &self,
        tx_id: TransactionId,
        decision: Decision,
        participant_ids: Vec<ParticipantId>,
    ) -> Result<()> {
        let log = self.decision_log.clone();
        let record = DecisionLogEntry::new(tx_id, decision, participant_ids);
        tokio::task::spawn_blocking(move || log.append(record))
            .await
            .map_err(|e| TwoPhaseError::DecisionLog(format!("Decision log write aborted: {e}")))
            .and_then(|appended| appended)
            .map(|_| ())
            .map_err(|e| {
                error!(
                    tx_id = %tx_id,
                    outcome = %decision,
                    error = %e,
                    "Decision log write failed"
                );
                e
            })
    }

    /// Answer an operation on a transaction no longer in the live table.
    fn settled(&self, tx_id: TransactionId, operation: Operation) -> Result<bool> {
        let decision = self
            .decision_log
            .decision(&tx_id)
            .ok_or(TwoPhaseError::UnknownTransaction(tx_id))?;

        match (decision, operation) {
            (Decision::Committed, Operation::Prepare | Operation::Commit) => Ok(true),
            (Decision::Aborted, Operation::Prepare) => Ok(false),
            (Decision::Aborted, Operation::Commit) => Err(TwoPhaseError::TransactionAborted(tx_id)),
            (Decision::Aborted, Operation::Rollback) => Ok(true),
            _ => Err(TwoPhaseError::InvalidState {
                tx_id,
                state: decision.state(),
                operation: operation.as_str(),
            }),
        }
    }

    fn entry(&self, tx_id: &TransactionId) -> Option<Arc<TransactionEntry>> {
        self.transactions.get(tx_id).map(|entry| entry.value().clone())
    }

    fn track(&self) -> Result<InFlight> {
        if self.state().is_terminal() {
            return Err(TwoPhaseError::CoordinatorUnavailable(
                "coordinator is stopped".to_string(),
            ));
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(InFlight(self.in_flight.clone()))
    }

    pub(crate) fn set_state(&self, state: CoordinatorState) -> CoordinatorState {
        std::mem::replace(&mut *self.state.write(), state)
    }

    async fn drain_in_flight(&self) {
        use tokio::time::{timeout, Duration};

        let drained = timeout(self.config.drain_timeout, async {
            loop {
                let running = self.in_flight.load(Ordering::SeqCst);
                if running == 0 {
                    break;
                }
                info!(running, "Waiting for running phases to complete");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                running = self.in_flight.load(Ordering::SeqCst),
                "Drain timed out"
            );
        }
    }
}

fn transition(
    context: &mut TransactionContext,
    next: TransactionState,
    operation: &'static str,
) -> Result<()> {
    let tx_id = context.id();
    context
        .transition_to(next)
        .map_err(|e| TwoPhaseError::InvalidState {
            tx_id,
            state: e.from,
            operation,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};
    use twophase_participant::ScriptedParticipant;

    fn create_test_coordinator() -> TransactionCoordinator {
        TransactionCoordinator::new(
            CoordinatorConfig::default(),
            Arc::new(MemoryDecisionLog::new()),
        )
    }

    #[tokio::test]
    async fn test_coordinator_creation() {
        let coordinator = create_test_coordinator();

        assert_eq!(coordinator.state(), CoordinatorState::Starting);
        assert_eq!(coordinator.active_transaction_count(), 0);
        assert!(coordinator.node_id().starts_with("coordinator-"));
    }

    #[tokio::test]
    async fn test_coordinator_start_stop() {
        let coordinator = create_test_coordinator();

        assert_ok!(coordinator.start().await);
        assert_eq!(coordinator.state(), CoordinatorState::Running);

        assert_ok!(coordinator.stop().await);
        assert_eq!(coordinator.state(), CoordinatorState::Stopped);

        let err = assert_err!(coordinator.begin());
        assert!(matches!(err, TwoPhaseError::CoordinatorUnavailable(_)));
    }

    #[tokio::test]
    async fn test_unknown_transaction() {
        let coordinator = create_test_coordinator();
        let tx_id = TransactionId::new();

        let participant: SharedParticipant = Arc::new(ScriptedParticipant::new("A"));
        assert!(matches!(
            coordinator.enlist(tx_id, participant),
            Err(TwoPhaseError::UnknownTransaction(_))
        ));
        assert!(matches!(
            coordinator.commit(tx_id).await,
            Err(TwoPhaseError::UnknownTransaction(_))
        ));
        assert!(matches!(
            coordinator.get_state(tx_id),
            Err(TwoPhaseError::UnknownTransaction(_))
        ));
    }

    #[tokio::test]
    async fn test_enlist_leaves_registry_untouched() {
        let coordinator = create_test_coordinator();
        let tx_id = coordinator.begin().unwrap();

        let participant: SharedParticipant = Arc::new(ScriptedParticipant::new("A"));
        assert_ok!(coordinator.enlist(tx_id, participant.clone()));
        assert_ok!(coordinator.enlist(tx_id, participant));

        assert_eq!(coordinator.participants(tx_id).unwrap().len(), 1);
        assert!(!coordinator.registry().contains(&ParticipantId::new("A")));
    }

    #[tokio::test]
    async fn test_commit_before_prepare_fails_fast() {
        let coordinator = create_test_coordinator();
        let tx_id = coordinator.begin().unwrap();

        let err = assert_err!(coordinator.commit(tx_id).await);
        assert!(matches!(
            err,
            TwoPhaseError::InvalidState {
                state: TransactionState::Initial,
                operation: "commit",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_rollback_from_initial() {
        let coordinator = create_test_coordinator();
        let tx_id = coordinator.begin().unwrap();
        let participant = Arc::new(ScriptedParticipant::new("A"));
        coordinator.enlist(tx_id, participant.clone()).unwrap();

        assert!(assert_ok!(coordinator.rollback(tx_id).await));
        assert_eq!(coordinator.get_state(tx_id).unwrap(), TransactionState::Aborted);
        assert_eq!(participant.rollback_calls(), 1);
        assert_eq!(participant.prepare_calls(), 0);
    }

    #[tokio::test]
    async fn test_terminal_contexts_are_evicted() {
        let coordinator = create_test_coordinator();
        let tx_id = coordinator.begin().unwrap();
        coordinator
            .enlist(tx_id, Arc::new(ScriptedParticipant::new("A")))
            .unwrap();

        assert!(coordinator.prepare(tx_id).await.unwrap());
        assert!(coordinator.commit(tx_id).await.unwrap());

        assert_eq!(coordinator.live_transaction_count(), 0);
        assert_eq!(coordinator.get_state(tx_id).unwrap(), TransactionState::Committed);

        let metrics = coordinator.metrics().snapshot();
        assert_eq!(metrics.transactions_begun, 1);
        assert_eq!(metrics.transactions_committed, 1);
    }

    #[tokio::test]
    async fn test_terminal_contexts_kept_without_eviction() {
        let config = CoordinatorConfig {
            evict_terminal: false,
            ..CoordinatorConfig::default()
        };
        let coordinator = TransactionCoordinator::new(config, Arc::new(MemoryDecisionLog::new()));
        let tx_id = coordinator.begin().unwrap();
        coordinator.rollback(tx_id).await.unwrap();

        assert_eq!(coordinator.live_transaction_count(), 1);
        assert_eq!(coordinator.active_transaction_count(), 0);
        assert!(coordinator.rollback(tx_id).await.unwrap());
    }
}
