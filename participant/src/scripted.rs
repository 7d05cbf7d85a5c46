//! A participant whose behaviour is configured up front.
//!
//! Used to exercise the coordinator: it can vote either way, stall, fail a
//! number of calls before succeeding, or go offline, and it records every
//! call it receives.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use twophase_common::{ParticipantError, ParticipantId, ParticipantResult, TransactionId, Vote};

use crate::participant::Participant;

/// Which participant operation was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Prepare,
    Commit,
    Rollback,
}

/// One recorded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallRecord {
    pub kind: CallKind,
    pub tx_id: TransactionId,
}

#[derive(Debug, Clone)]
struct Script {
    vote: Vote,
    prepare_error: Option<ParticipantError>,
    prepare_delay: Duration,
    commit_delay: Duration,
    /// Commit calls that fail before one succeeds; `u32::MAX` fails forever.
    commit_failures: u32,
    rollback_failures: u32,
    offline: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            vote: Vote::Commit,
            prepare_error: None,
            prepare_delay: Duration::ZERO,
            commit_delay: Duration::ZERO,
            commit_failures: 0,
            rollback_failures: 0,
            offline: false,
        }
    }
}

/// Configurable participant that records its calls.
pub struct ScriptedParticipant {
    id: ParticipantId,
    script: Mutex<Script>,
    calls: Mutex<Vec<CallRecord>>,
    prepare_calls: AtomicU32,
    commit_calls: AtomicU32,
    rollback_calls: AtomicU32,
}

impl ScriptedParticipant {
    /// A participant that votes commit and never fails.
    pub fn new(id: impl Into<ParticipantId>) -> Self {
        Self {
            id: id.into(),
            script: Mutex::new(Script::default()),
            calls: Mutex::new(Vec::new()),
            prepare_calls: AtomicU32::new(0),
            commit_calls: AtomicU32::new(0),
            rollback_calls: AtomicU32::new(0),
        }
    }

    /// Vote `vote` on every prepare.
    pub fn voting(self, vote: Vote) -> Self {
        self.script.lock().vote = vote;
        self
    }

    /// Fail every prepare with `error`.
    pub fn failing_prepare(self, error: ParticipantError) -> Self {
        self.script.lock().prepare_error = Some(error);
        self
    }

    /// Wait `delay` before answering prepare.
    pub fn with_prepare_delay(self, delay: Duration) -> Self {
        self.script.lock().prepare_delay = delay;
        self
    }

    /// Wait `delay` before answering commit.
    pub fn with_commit_delay(self, delay: Duration) -> Self {
        self.script.lock().commit_delay = delay;
        self
    }

    /// Fail the next `count` commit calls.
    pub fn failing_commits(self, count: u32) -> Self {
        self.script.lock().commit_failures = count;
        self
    }

    /// Fail every commit call.
    pub fn failing_commits_always(self) -> Self {
        self.failing_commits(u32::MAX)
    }

    /// Fail the next `count` rollback calls.
    pub fn failing_rollbacks(self, count: u32) -> Self {
        self.script.lock().rollback_failures = count;
        self
    }

    /// Change the vote at runtime.
    pub fn set_vote(&self, vote: Vote) {
        self.script.lock().vote = vote;
    }

    /// Change the prepare delay at runtime.
    pub fn set_prepare_delay(&self, delay: Duration) {
        self.script.lock().prepare_delay = delay;
    }

    /// Set the number of commit calls that will fail from now on.
    pub fn set_commit_failures(&self, count: u32) {
        self.script.lock().commit_failures = count;
    }

    /// Take the participant offline or bring it back.
    pub fn set_offline(&self, offline: bool) {
        self.script.lock().offline = offline;
    }

    pub fn prepare_calls(&self) -> u32 {
        self.prepare_calls.load(Ordering::SeqCst)
    }

    pub fn commit_calls(&self) -> u32 {
        self.commit_calls.load(Ordering::SeqCst)
    }

    pub fn rollback_calls(&self) -> u32 {
        self.rollback_calls.load(Ordering::SeqCst)
    }

    /// Every call received, in arrival order.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    /// Calls received for one transaction.
    pub fn calls_for(&self, tx_id: TransactionId) -> Vec<CallKind> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.tx_id == tx_id)
            .map(|call| call.kind)
            .collect()
    }

    fn record(&self, kind: CallKind, tx_id: TransactionId) {
        let counter = match kind {
            CallKind::Prepare => &self.prepare_calls,
            CallKind::Commit => &self.commit_calls,
            CallKind::Rollback => &self.rollback_calls,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().push(CallRecord { kind, tx_id });
        debug!(participant_id = %self.id, tx_id = %tx_id, call = ?kind, "Scripted call");
    }

    fn offline_error(&self) -> ParticipantError {
        ParticipantError::Unavailable(format!("{} is offline", self.id))
    }

    /// Consume one scripted failure from `counter`, returning whether this call fails.
    fn take_failure(counter: &mut u32) -> bool {
        match *counter {
            0 => false,
            u32::MAX => true,
            _ => {
                *counter -= 1;
                true
            }
        }
    }
}

#[async_trait::async_trait]
impl Participant for ScriptedParticipant {
    fn id(&self) -> &ParticipantId {
        &self.id
    }

    async fn prepare(&self, tx_id: TransactionId) -> ParticipantResult<Vote> {
        self.record(CallKind::Prepare, tx_id);
        let script = self.script.lock().clone();

        if !script.prepare_delay.is_zero() {
            tokio::time::sleep(script.prepare_delay).await;
        }
        if script.offline {
            return Err(self.offline_error());
        }
        match script.prepare_error {
            Some(error) => Err(error),
            None => Ok(script.vote),
        }
    }

    async fn commit(&self, tx_id: TransactionId) -> ParticipantResult<()> {
        self.record(CallKind::Commit, tx_id);
        let delay = self.script.lock().commit_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.script.lock();
        if script.offline {
            return Err(self.offline_error());
        }
        if Self::take_failure(&mut script.commit_failures) {
            return Err(ParticipantError::Internal(format!(
                "{} scripted commit failure",
                self.id
            )));
        }
        Ok(())
    }

    async fn rollback(&self, tx_id: TransactionId) -> ParticipantResult<()> {
        self.record(CallKind::Rollback, tx_id);

        let mut script = self.script.lock();
        if script.offline {
            return Err(self.offline_error());
        }
        if Self::take_failure(&mut script.rollback_failures) {
            return Err(ParticipantError::Internal(format!(
                "{} scripted rollback failure",
                self.id
            )));
        }
        Ok(())
    }
}
