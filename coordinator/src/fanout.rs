//! Concurrent participant calls.
//!
//! Every phase calls all participants at once and waits for every outcome.
//! A failing call never cancels its siblings. Prepare gets one bounded
//! attempt per participant; commit and rollback retry with exponential
//! backoff.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, warn};

use twophase_common::{
    ParticipantError, ParticipantId, ParticipantResult, TransactionId, TwoPhaseError, Vote,
};
use twophase_participant::SharedParticipant;

use crate::config::RetryConfig;
use crate::metrics::SharedMetrics;

/// Votes collected from one prepare round.
#[derive(Debug, Default)]
pub struct PrepareOutcome {
    pub votes: Vec<(ParticipantId, ParticipantResult<Vote>)>,
}

impl PrepareOutcome {
    /// True when every participant voted commit. Vacuously true with no participants.
    pub fn is_unanimous(&self) -> bool {
        self.votes
            .iter()
            .all(|(_, vote)| matches!(vote, Ok(Vote::Commit)))
    }

    /// Per-participant failures, with abort votes reported as rejections.
    pub fn failures(&self, tx_id: TransactionId) -> Vec<TwoPhaseError> {
        self.votes
            .iter()
            .filter_map(|(participant, vote)| {
                let source = match vote {
                    Ok(Vote::Commit) => return None,
                    Ok(Vote::Abort) => ParticipantError::Rejected("voted abort".to_string()),
                    Err(e) => e.clone(),
                };
                Some(TwoPhaseError::ParticipantPrepareFailed {
                    tx_id,
                    participant: participant.clone(),
                    source,
                })
            })
            .collect()
    }
}

/// Results of a commit or rollback round.
#[derive(Debug, Default)]
pub struct PhaseOutcome {
    /// Participants whose call eventually succeeded.
    pub acknowledged: Vec<ParticipantId>,
    /// Participants that failed every attempt.
    pub failures: Vec<TwoPhaseError>,
}

impl PhaseOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Clone, Copy)]
enum PhaseCall {
    Commit,
    Rollback,
}

impl PhaseCall {
    fn name(self) -> &'static str {
        match self {
            PhaseCall::Commit => "commit",
            PhaseCall::Rollback => "rollback",
        }
    }
}

/// Runs participant calls for the coordinator.
pub struct FanOut {
    prepare_timeout: Duration,
    commit_retry: RetryConfig,
    rollback_retry: RetryConfig,
    metrics: SharedMetrics,
}

impl FanOut {
    pub fn new(
        prepare_timeout: Duration,
        commit_retry: RetryConfig,
        rollback_retry: RetryConfig,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            prepare_timeout,
            commit_retry,
            rollback_retry,
            metrics,
        }
    }

    /// Ask every participant to prepare, each within the prepare timeout.
    pub async fn prepare_all(
        &self,
        tx_id: TransactionId,
        participants: &[SharedParticipant],
    ) -> PrepareOutcome {
        let calls = participants.iter().map(|participant| async move {
            let id = participant.id().clone();
            debug!(tx_id = %tx_id, participant_id = %id, "Sending prepare");

            let vote = bounded(self.prepare_timeout, participant.prepare(tx_id)).await;
            match &vote {
                Ok(Vote::Commit) => {
                    debug!(tx_id = %tx_id, participant_id = %id, "Participant voted commit");
                }
                Ok(Vote::Abort) => {
                    self.metrics.prepare_rejected();
                    warn!(tx_id = %tx_id, participant_id = %id, "Participant voted abort");
                }
                Err(ParticipantError::Timeout(budget)) => {
                    self.metrics.prepare_timed_out();
                    warn!(
                        tx_id = %tx_id,
                        participant_id = %id,
                        timeout_ms = budget.as_millis() as u64,
                        "Prepare timed out"
                    );
                }
                Err(e) => {
                    self.metrics.prepare_rejected();
                    warn!(
                        tx_id = %tx_id,
                        participant_id = %id,
                        error = %e,
                        error_code = e.error_code(),
                        "Prepare failed"
                    );
                }
            }
            (id, vote)
        });

        PrepareOutcome {
            votes: join_all(calls).await,
        }
    }

    /// Commit on every participant, retrying each one independently.
    pub async fn commit_all(
        &self,
        tx_id: TransactionId,
        participants: &[SharedParticipant],
    ) -> PhaseOutcome {
        self.run_phase(tx_id, participants, PhaseCall::Commit).await
    }

    /// Roll back every participant, retrying each one independently.
    pub async fn rollback_all(
        &self,
        tx_id: TransactionId,
        participants: &[SharedParticipant],
    ) -> PhaseOutcome {
        self.run_phase(tx_id, participants, PhaseCall::Rollback).await
    }

    async fn run_phase(
        &self,
        tx_id: TransactionId,
        participants: &[SharedParticipant],
        call: PhaseCall,
    ) -> PhaseOutcome {
        let retry = match call {
            PhaseCall::Commit => &self.commit_retry,
            PhaseCall::Rollback => &self.rollback_retry,
        };

        let calls = participants.iter().map(|participant| async move {
            let id = participant.id().clone();
            let result = self
                .call_with_retry(tx_id, participant, call, retry)
                .await
                .map_err(|(attempts, source)| match call {
                    PhaseCall::Commit => TwoPhaseError::ParticipantCommitFailed {
                        tx_id,
                        participant: id.clone(),
                        attempts,
                        source,
                    },
                    PhaseCall::Rollback => TwoPhaseError::ParticipantRollbackFailed {
                        tx_id,
                        participant: id.clone(),
                        source,
                    },
                });
            (id, result)
        });

        let mut outcome = PhaseOutcome::default();
        for (id, result) in join_all(calls).await {
            match result {
                Ok(()) => outcome.acknowledged.push(id),
                Err(e) => outcome.failures.push(e),
            }
        }
        outcome
    }

    /// Returns the attempt count and last error when every attempt failed.
    async fn call_with_retry(
        &self,
        tx_id: TransactionId,
        participant: &SharedParticipant,
        call: PhaseCall,
        retry: &RetryConfig,
    ) -> Result<(), (u32, ParticipantError)> {
        let id = participant.id();
        let mut attempt = 1;

        loop {
            debug!(tx_id = %tx_id, participant_id = %id, attempt, "Sending {}", call.name());

            let result = match call {
                PhaseCall::Commit => bounded(retry.call_timeout, participant.commit(tx_id)).await,
                PhaseCall::Rollback => {
                    bounded(retry.call_timeout, participant.rollback(tx_id)).await
                }
            };

            let e = match result {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if attempt >= retry.max_attempts {
                match call {
                    PhaseCall::Commit => error!(
                        tx_id = %tx_id,
                        participant_id = %id,
                        attempts = attempt,
                        error = %e,
                        "Commit retries exhausted"
                    ),
                    PhaseCall::Rollback => {
                        self.metrics.rollback_failed();
                        warn!(
                            tx_id = %tx_id,
                            participant_id = %id,
                            attempts = attempt,
                            error = %e,
                            "Rollback failed, continuing"
                        );
                    }
                }
                return Err((attempt, e));
            }

            let delay = retry.delay_for(attempt);
            self.metrics.participant_retried();
            warn!(
                tx_id = %tx_id,
                participant_id = %id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "Participant {} failed, retrying",
                call.name()
            );
            sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Run one participant call within `budget`, turning a panic into an error.
async fn bounded<T>(
    budget: Duration,
    call: impl Future<Output = ParticipantResult<T>>,
) -> ParticipantResult<T> {
    match timeout(budget, AssertUnwindSafe(call).catch_unwind()).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(ParticipantError::Internal(
            "participant panicked".to_string(),
        )),
        Err(_) => Err(ParticipantError::Timeout(budget)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use twophase_participant::ScriptedParticipant;

    use crate::metrics::Metrics;

    fn fan_out(metrics: SharedMetrics) -> FanOut {
        let retry = RetryConfig {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(10),
            call_timeout: Duration::from_millis(200),
        };
        FanOut::new(Duration::from_millis(100), retry.clone(), retry, metrics)
    }

    #[tokio::test]
    async fn test_prepare_collects_every_vote() {
        let metrics = Arc::new(Metrics::new());
        let fan_out = fan_out(metrics.clone());
        let yes = Arc::new(ScriptedParticipant::new("yes"));
        let no = Arc::new(ScriptedParticipant::new("no").voting(Vote::Abort));
        let slow = Arc::new(
            ScriptedParticipant::new("slow").with_prepare_delay(Duration::from_millis(500)),
        );
        let participants: Vec<SharedParticipant> = vec![yes.clone(), no.clone(), slow.clone()];

        let tx_id = TransactionId::new();
        let outcome = fan_out.prepare_all(tx_id, &participants).await;

        assert!(!outcome.is_unanimous());
        assert_eq!(outcome.votes.len(), 3);
        assert!(matches!(outcome.votes[2].1, Err(ParticipantError::Timeout(_))));
        assert_eq!(outcome.failures(tx_id).len(), 2);
        assert_eq!(yes.prepare_calls(), 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.prepare_rejections, 1);
        assert_eq!(snapshot.prepare_timeouts, 1);
    }

    #[tokio::test]
    async fn test_empty_prepare_is_unanimous() {
        let fan_out = fan_out(Arc::new(Metrics::new()));
        let outcome = fan_out.prepare_all(TransactionId::new(), &[]).await;
        assert!(outcome.is_unanimous());
    }

    #[tokio::test]
    async fn test_commit_retries_transient_failures() {
        let metrics = Arc::new(Metrics::new());
        let fan_out = fan_out(metrics.clone());
        let flaky = Arc::new(ScriptedParticipant::new("flaky").failing_commits(2));
        let participants: Vec<SharedParticipant> = vec![flaky.clone()];

        let outcome = fan_out.commit_all(TransactionId::new(), &participants).await;

        assert!(outcome.is_complete());
        assert_eq!(outcome.acknowledged, vec![ParticipantId::new("flaky")]);
        assert_eq!(flaky.commit_calls(), 3);
        assert_eq!(metrics.snapshot().participant_retries, 2);
    }

    #[tokio::test]
    async fn test_commit_gives_up_after_max_attempts() {
        let fan_out = fan_out(Arc::new(Metrics::new()));
        let broken = Arc::new(ScriptedParticipant::new("broken").failing_commits_always());
        let healthy = Arc::new(ScriptedParticipant::new("healthy"));
        let participants: Vec<SharedParticipant> = vec![broken.clone(), healthy.clone()];

        let outcome = fan_out.commit_all(TransactionId::new(), &participants).await;

        assert!(!outcome.is_complete());
        assert_eq!(outcome.acknowledged, vec![ParticipantId::new("healthy")]);
        assert!(matches!(
            outcome.failures[0],
            TwoPhaseError::ParticipantCommitFailed { attempts: 3, .. }
        ));
        assert_eq!(broken.commit_calls(), 3);
        assert_eq!(healthy.commit_calls(), 1);
    }

    #[tokio::test]
    async fn test_rollback_failure_does_not_block_siblings() {
        let metrics = Arc::new(Metrics::new());
        let fan_out = fan_out(metrics.clone());
        let stuck = Arc::new(ScriptedParticipant::new("stuck").failing_rollbacks(u32::MAX));
        let fine = Arc::new(ScriptedParticipant::new("fine"));
        let participants: Vec<SharedParticipant> = vec![stuck.clone(), fine.clone()];

        let outcome = fan_out.rollback_all(TransactionId::new(), &participants).await;

        assert_eq!(outcome.acknowledged, vec![ParticipantId::new("fine")]);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(fine.rollback_calls(), 1);
        assert_eq!(metrics.snapshot().rollback_failures, 1);
    }
}
