//! Protocol behaviour of the coordinator against scripted participants.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use twophase_common::{
    Decision, ParticipantError, ParticipantId, ParticipantResult, TransactionId,
    TransactionState, TwoPhaseError, Vote,
};
use twophase_coordinator::{
    CoordinatorConfig, DecisionLog, DecisionLogEntry, MemoryDecisionLog, TransactionCoordinator,
};
use twophase_participant::{CallKind, Participant, ScriptedParticipant, SharedParticipant};

fn test_config() -> CoordinatorConfig {
    CoordinatorConfig::default()
        .with_call_timeout(Duration::from_millis(200))
        .with_backoff_base(Duration::from_millis(5))
}

/// Route coordinator logs through the test harness; `RUST_LOG` selects levels.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn coordinator_with_log() -> (TransactionCoordinator, Arc<MemoryDecisionLog>) {
    init_tracing();
    let log = Arc::new(MemoryDecisionLog::new());
    let coordinator = TransactionCoordinator::new(test_config(), log.clone());
    (coordinator, log)
}

fn enlist_all(
    coordinator: &TransactionCoordinator,
    tx_id: TransactionId,
    participants: &[&Arc<ScriptedParticipant>],
) {
    for participant in participants {
        let shared: SharedParticipant = (*participant).clone();
        coordinator.enlist(tx_id, shared).unwrap();
    }
}

#[tokio::test]
async fn unanimous_votes_commit_each_participant_once() {
    let (coordinator, log) = coordinator_with_log();
    let a = Arc::new(ScriptedParticipant::new("A"));
    let b = Arc::new(ScriptedParticipant::new("B"));

    let tx_id = coordinator.begin().unwrap();
    enlist_all(&coordinator, tx_id, &[&a, &b]);

    assert!(assert_ok!(coordinator.prepare(tx_id).await));
    assert_eq!(coordinator.get_state(tx_id).unwrap(), TransactionState::Prepared);
    assert!(assert_ok!(coordinator.commit(tx_id).await));

    for participant in [&a, &b] {
        assert_eq!(
            participant.calls_for(tx_id),
            vec![CallKind::Prepare, CallKind::Commit]
        );
    }
    assert_eq!(coordinator.get_state(tx_id).unwrap(), TransactionState::Committed);

    let outcomes: Vec<Decision> = log
        .entries()
        .unwrap()
        .into_iter()
        .map(|entry| entry.outcome)
        .collect();
    assert_eq!(
        outcomes,
        vec![Decision::Preparing, Decision::Prepared, Decision::Committed]
    );
}

#[tokio::test]
async fn single_abort_vote_rolls_everyone_back() {
    let (coordinator, log) = coordinator_with_log();
    let a = Arc::new(ScriptedParticipant::new("A"));
    let b = Arc::new(ScriptedParticipant::new("B").voting(Vote::Abort));

    let tx_id = coordinator.begin().unwrap();
    enlist_all(&coordinator, tx_id, &[&a, &b]);

    assert!(!assert_ok!(coordinator.prepare(tx_id).await));

    for participant in [&a, &b] {
        assert_eq!(participant.commit_calls(), 0);
        assert!(participant.rollback_calls() >= 1);
    }
    assert_eq!(coordinator.get_state(tx_id).unwrap(), TransactionState::Aborted);
    assert_eq!(log.decision(&tx_id), Some(Decision::Aborted));

    let err = assert_err!(coordinator.commit(tx_id).await);
    assert!(matches!(err, TwoPhaseError::TransactionAborted(id) if id == tx_id));
    assert_eq!(a.commit_calls(), 0);
}

#[tokio::test]
async fn prepare_error_counts_as_abort_vote() {
    let (coordinator, _log) = coordinator_with_log();
    let a = Arc::new(ScriptedParticipant::new("A"));
    let b = Arc::new(
        ScriptedParticipant::new("B")
            .failing_prepare(ParticipantError::Unavailable("connection refused".into())),
    );

    let tx_id = coordinator.begin().unwrap();
    enlist_all(&coordinator, tx_id, &[&a, &b]);

    assert!(!coordinator.prepare(tx_id).await.unwrap());
    assert_eq!(a.rollback_calls(), 1);
    assert_eq!(b.rollback_calls(), 1);
    assert_eq!(coordinator.metrics().snapshot().prepare_rejections, 1);
}

#[tokio::test]
async fn slow_prepare_is_treated_as_abort() {
    let (coordinator, _log) = coordinator_with_log();
    let slow = Arc::new(
        ScriptedParticipant::new("A").with_prepare_delay(Duration::from_millis(600)),
    );
    let fast = Arc::new(
        ScriptedParticipant::new("B").with_prepare_delay(Duration::from_millis(50)),
    );

    let tx_id = coordinator.begin().unwrap();
    enlist_all(&coordinator, tx_id, &[&slow, &fast]);

    let started = tokio::time::Instant::now();
    assert!(!coordinator.prepare(tx_id).await.unwrap());
    assert!(started.elapsed() < Duration::from_millis(550));

    assert_eq!(slow.rollback_calls(), 1);
    assert_eq!(fast.rollback_calls(), 1);
    assert_eq!(slow.commit_calls(), 0);
    assert_eq!(fast.commit_calls(), 0);
    assert_eq!(coordinator.metrics().snapshot().prepare_timeouts, 1);
}

#[tokio::test]
async fn repeated_commit_and_rollback_are_idempotent() {
    let (coordinator, _log) = coordinator_with_log();
    let a = Arc::new(ScriptedParticipant::new("A"));

    let committed = coordinator.begin().unwrap();
    enlist_all(&coordinator, committed, &[&a]);
    coordinator.prepare(committed).await.unwrap();

    assert!(coordinator.commit(committed).await.unwrap());
    assert!(coordinator.commit(committed).await.unwrap());
    assert!(coordinator.prepare(committed).await.unwrap());
    assert_eq!(a.commit_calls(), 1);

    let err = assert_err!(coordinator.rollback(committed).await);
    assert!(matches!(
        err,
        TwoPhaseError::InvalidState {
            state: TransactionState::Committed,
            ..
        }
    ));

    let b = Arc::new(ScriptedParticipant::new("B"));
    let aborted = coordinator.begin().unwrap();
    enlist_all(&coordinator, aborted, &[&b]);
    coordinator.prepare(aborted).await.unwrap();

    assert!(coordinator.rollback(aborted).await.unwrap());
    assert!(coordinator.rollback(aborted).await.unwrap());
    assert!(!coordinator.prepare(aborted).await.unwrap());
    assert_eq!(b.rollback_calls(), 1);
}

#[tokio::test]
async fn exhausted_commit_never_rolls_back() {
    let (coordinator, log) = coordinator_with_log();
    let healthy = Arc::new(ScriptedParticipant::new("A"));
    let broken = Arc::new(ScriptedParticipant::new("B").failing_commits_always());

    let tx_id = coordinator.begin().unwrap();
    enlist_all(&coordinator, tx_id, &[&healthy, &broken]);
    assert!(coordinator.prepare(tx_id).await.unwrap());

    assert!(!assert_ok!(coordinator.commit(tx_id).await));

    assert_eq!(broken.commit_calls(), 3);
    assert_eq!(healthy.commit_calls(), 1);
    assert_eq!(healthy.rollback_calls(), 0);
    assert_eq!(broken.rollback_calls(), 0);
    assert_eq!(coordinator.get_state(tx_id).unwrap(), TransactionState::Committing);
    assert_eq!(log.decision(&tx_id), Some(Decision::Prepared));
    assert_eq!(coordinator.metrics().snapshot().commit_failures, 1);

    let err = assert_err!(coordinator.rollback(tx_id).await);
    assert!(matches!(
        err,
        TwoPhaseError::InvalidState {
            state: TransactionState::Committing,
            ..
        }
    ));
}

#[tokio::test]
async fn commit_resumes_only_unacknowledged_participants() {
    let (coordinator, _log) = coordinator_with_log();
    let healthy = Arc::new(ScriptedParticipant::new("A"));
    let flaky = Arc::new(ScriptedParticipant::new("B").failing_commits_always());

    let tx_id = coordinator.begin().unwrap();
    enlist_all(&coordinator, tx_id, &[&healthy, &flaky]);
    coordinator.prepare(tx_id).await.unwrap();
    assert!(!coordinator.commit(tx_id).await.unwrap());

    flaky.set_commit_failures(0);
    assert!(coordinator.commit(tx_id).await.unwrap());

    assert_eq!(healthy.commit_calls(), 1);
    assert_eq!(flaky.commit_calls(), 4);
    assert_eq!(coordinator.get_state(tx_id).unwrap(), TransactionState::Committed);
}

#[tokio::test]
async fn transient_commit_failures_are_retried() {
    let (coordinator, _log) = coordinator_with_log();
    let flaky = Arc::new(ScriptedParticipant::new("A").failing_commits(2));

    let tx_id = coordinator.begin().unwrap();
    enlist_all(&coordinator, tx_id, &[&flaky]);
    coordinator.prepare(tx_id).await.unwrap();

    assert!(coordinator.commit(tx_id).await.unwrap());
    assert_eq!(flaky.commit_calls(), 3);
    assert_eq!(coordinator.metrics().snapshot().participant_retries, 2);
}

#[tokio::test]
async fn rollback_failures_do_not_block_abort() {
    let (coordinator, log) = coordinator_with_log();
    let stuck = Arc::new(ScriptedParticipant::new("A").failing_rollbacks(u32::MAX));
    let fine = Arc::new(ScriptedParticipant::new("B"));

    let tx_id = coordinator.begin().unwrap();
    enlist_all(&coordinator, tx_id, &[&stuck, &fine]);
    coordinator.prepare(tx_id).await.unwrap();

    assert!(coordinator.rollback(tx_id).await.unwrap());
    assert_eq!(stuck.rollback_calls(), 3);
    assert_eq!(fine.rollback_calls(), 1);
    assert_eq!(log.decision(&tx_id), Some(Decision::Aborted));
}

#[tokio::test]
async fn enlist_after_prepare_is_rejected() {
    let (coordinator, _log) = coordinator_with_log();
    let a = Arc::new(ScriptedParticipant::new("A"));

    let tx_id = coordinator.begin().unwrap();
    enlist_all(&coordinator, tx_id, &[&a]);
    coordinator.prepare(tx_id).await.unwrap();

    let late: SharedParticipant = Arc::new(ScriptedParticipant::new("B"));
    let err = assert_err!(coordinator.enlist(tx_id, late));
    assert!(matches!(
        err,
        TwoPhaseError::InvalidState {
            state: TransactionState::Prepared,
            operation: "enlist",
            ..
        }
    ));
}

#[tokio::test]
async fn evicted_transactions_answer_from_the_log() {
    let (coordinator, _log) = coordinator_with_log();
    let a = Arc::new(ScriptedParticipant::new("A"));

    let tx_id = coordinator.begin().unwrap();
    enlist_all(&coordinator, tx_id, &[&a]);
    coordinator.prepare(tx_id).await.unwrap();
    coordinator.commit(tx_id).await.unwrap();
    assert_eq!(coordinator.live_transaction_count(), 0);

    assert!(coordinator.commit(tx_id).await.unwrap());
    assert_eq!(coordinator.get_state(tx_id).unwrap(), TransactionState::Committed);
    assert!(matches!(
        coordinator.enlist(tx_id, a.clone()),
        Err(TwoPhaseError::InvalidState { .. })
    ));
    assert_eq!(a.commit_calls(), 1);
}

#[tokio::test]
async fn finished_transactions_release_their_participants() {
    let (coordinator, _log) = coordinator_with_log();
    let mut participants = Vec::new();

    for i in 0..500 {
        let participant = Arc::new(ScriptedParticipant::new(format!("order-{i}")));
        let tx_id = coordinator.begin().unwrap();
        enlist_all(&coordinator, tx_id, &[&participant]);
        assert!(coordinator.prepare(tx_id).await.unwrap());
        assert!(coordinator.commit(tx_id).await.unwrap());
        participants.push(participant);
    }

    assert_eq!(coordinator.live_transaction_count(), 0);
    assert!(coordinator.registry().is_empty());
    for participant in &participants {
        assert_eq!(Arc::strong_count(participant), 1);
    }
}

/// Memory log whose appends block the calling thread like a slow disk.
struct SlowDiskLog {
    inner: MemoryDecisionLog,
    delay: Duration,
}

impl DecisionLog for SlowDiskLog {
    fn append(&self, entry: DecisionLogEntry) -> twophase_common::Result<bool> {
        std::thread::sleep(self.delay);
        self.inner.append(entry)
    }

    fn entries(&self) -> twophase_common::Result<Vec<DecisionLogEntry>> {
        self.inner.entries()
    }

    fn decision(&self, tx_id: &TransactionId) -> Option<Decision> {
        self.inner.decision(tx_id)
    }

    fn pending(&self) -> Vec<DecisionLogEntry> {
        self.inner.pending()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

#[tokio::test]
async fn decision_log_writes_do_not_block_the_runtime() {
    init_tracing();
    let log = Arc::new(SlowDiskLog {
        inner: MemoryDecisionLog::new(),
        delay: Duration::from_millis(100),
    });
    let coordinator = TransactionCoordinator::new(test_config(), log.clone());
    let a = Arc::new(ScriptedParticipant::new("A"));
    let tx_id = coordinator.begin().unwrap();
    enlist_all(&coordinator, tx_id, &[&a]);

    let ticks = Arc::new(AtomicUsize::new(0));
    let ticker = {
        let ticks = ticks.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                ticks.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    // Two appends of 100ms each on a single-threaded runtime.
    assert!(coordinator.prepare(tx_id).await.unwrap());
    ticker.abort();

    assert!(ticks.load(Ordering::SeqCst) >= 5);
    assert_eq!(log.len(), 2);
}

#[tokio::test]
async fn get_state_does_not_wait_for_running_phase() {
    let (coordinator, _log) = coordinator_with_log();
    let coordinator = Arc::new(coordinator);
    let slow = Arc::new(
        ScriptedParticipant::new("A").with_prepare_delay(Duration::from_millis(150)),
    );

    let tx_id = coordinator.begin().unwrap();
    enlist_all(&coordinator, tx_id, &[&slow]);

    let preparing = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.prepare(tx_id).await })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(coordinator.get_state(tx_id).unwrap(), TransactionState::Preparing);

    assert!(preparing.await.unwrap().unwrap());
    assert_eq!(coordinator.get_state(tx_id).unwrap(), TransactionState::Prepared);
}

struct PanickingParticipant {
    id: ParticipantId,
}

#[async_trait::async_trait]
impl Participant for PanickingParticipant {
    fn id(&self) -> &ParticipantId {
        &self.id
    }

    async fn prepare(&self, _tx_id: TransactionId) -> ParticipantResult<Vote> {
        panic!("prepare exploded");
    }

    async fn commit(&self, _tx_id: TransactionId) -> ParticipantResult<()> {
        Ok(())
    }

    async fn rollback(&self, _tx_id: TransactionId) -> ParticipantResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn panicking_participant_aborts_the_transaction() {
    let (coordinator, _log) = coordinator_with_log();
    let a = Arc::new(ScriptedParticipant::new("A"));

    let tx_id = coordinator.begin().unwrap();
    enlist_all(&coordinator, tx_id, &[&a]);
    coordinator
        .enlist(
            tx_id,
            Arc::new(PanickingParticipant {
                id: ParticipantId::new("B"),
            }),
        )
        .unwrap();

    assert!(!coordinator.prepare(tx_id).await.unwrap());
    assert_eq!(a.rollback_calls(), 1);
    assert_eq!(coordinator.get_state(tx_id).unwrap(), TransactionState::Aborted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_transactions_stay_isolated() {
    let (coordinator, log) = coordinator_with_log();
    let coordinator = Arc::new(coordinator);

    let mut handles = Vec::new();
    for i in 0..16 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            let first = Arc::new(ScriptedParticipant::new(format!("P{i}-1")));
            let vote = if i % 3 == 0 { Vote::Abort } else { Vote::Commit };
            let second = Arc::new(
                ScriptedParticipant::new(format!("P{i}-2"))
                    .voting(vote)
                    .with_prepare_delay(Duration::from_millis((i % 4) * 10)),
            );

            let tx_id = coordinator.begin().unwrap();
            coordinator.enlist(tx_id, first.clone()).unwrap();
            coordinator.enlist(tx_id, second.clone()).unwrap();

            let prepared = coordinator.prepare(tx_id).await.unwrap();
            if prepared {
                assert!(coordinator.commit(tx_id).await.unwrap());
            }
            (tx_id, vote, first, second)
        }));
    }

    for handle in handles {
        let (tx_id, vote, first, second) = handle.await.unwrap();
        let expected = match vote {
            Vote::Commit => TransactionState::Committed,
            Vote::Abort => TransactionState::Aborted,
        };
        assert_eq!(coordinator.get_state(tx_id).unwrap(), expected);

        for participant in [&first, &second] {
            assert!(participant.calls().iter().all(|call| call.tx_id == tx_id));
            match vote {
                Vote::Commit => assert_eq!(participant.commit_calls(), 1),
                Vote::Abort => assert_eq!(participant.commit_calls(), 0),
            }
        }
    }

    assert!(log.pending().is_empty());
    let metrics = coordinator.metrics().snapshot();
    assert_eq!(metrics.transactions_begun, 16);
    assert_eq!(metrics.transactions_committed + metrics.transactions_aborted, 16);
}

#[tokio::test]
async fn stop_waits_for_running_phase() {
    let config = test_config();
    let coordinator = Arc::new(TransactionCoordinator::new(
        config,
        Arc::new(MemoryDecisionLog::new()),
    ));
    coordinator.start().await.unwrap();

    let slow = Arc::new(
        ScriptedParticipant::new("A").with_prepare_delay(Duration::from_millis(100)),
    );
    let tx_id = coordinator.begin().unwrap();
    enlist_all(&coordinator, tx_id, &[&slow]);

    let preparing = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.prepare(tx_id).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    coordinator.stop().await.unwrap();
    assert!(preparing.is_finished());
    assert!(preparing.await.unwrap().unwrap());

    assert!(matches!(
        coordinator.begin(),
        Err(TwoPhaseError::CoordinatorUnavailable(_))
    ));
}
