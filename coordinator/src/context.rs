//! In-memory record of one transaction.

use std::collections::HashSet;

use twophase_common::{
    now, InvalidTransition, ParticipantId, Result, Timestamp, TransactionId, TransactionState,
    TwoPhaseError,
};
use twophase_participant::SharedParticipant;

/// One transaction's enlisted participants and state.
///
/// Participants keep their enlistment order so log records are
/// deterministic; calls to them still fan out concurrently.
pub struct TransactionContext {
    id: TransactionId,
    state: TransactionState,
    participants: Vec<SharedParticipant>,
    /// IDs recovery could not resolve to a participant.
    unresolved: Vec<ParticipantId>,
    /// Participants that acknowledged commit.
    acknowledged: HashSet<ParticipantId>,
    created_at: Timestamp,
    updated_at: Timestamp,
}

impl TransactionContext {
    /// Create a context in `Initial`.
    pub fn new(id: TransactionId) -> Self {
        let created_at = now();
        Self {
            id,
            state: TransactionState::Initial,
            participants: Vec::new(),
            unresolved: Vec::new(),
            acknowledged: HashSet::new(),
            created_at,
            updated_at: created_at,
        }
    }

    /// Rebuild a context from the decision log.
    pub fn restored(
        id: TransactionId,
        state: TransactionState,
        participants: Vec<SharedParticipant>,
        unresolved: Vec<ParticipantId>,
    ) -> Self {
        let mut context = Self::new(id);
        context.state = state;
        context.participants = participants;
        context.unresolved = unresolved;
        context
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    pub fn participants(&self) -> &[SharedParticipant] {
        &self.participants
    }

    pub fn unresolved(&self) -> &[ParticipantId] {
        &self.unresolved
    }

    /// All participant IDs in enlistment order, unresolved ones last.
    pub fn participant_ids(&self) -> Vec<ParticipantId> {
        self.participants
            .iter()
            .map(|participant| participant.id().clone())
            .chain(self.unresolved.iter().cloned())
            .collect()
    }

    /// Add a participant. Returns `false` if one with the same ID is already enlisted.
    pub fn enlist(&mut self, participant: SharedParticipant) -> Result<bool> {
        if self.state != TransactionState::Initial {
            return Err(TwoPhaseError::InvalidState {
                tx_id: self.id,
                state: self.state,
                operation: "enlist",
            });
        }

        if self
            .participants
            .iter()
            .any(|enlisted| enlisted.id() == participant.id())
        {
            return Ok(false);
        }

        self.participants.push(participant);
        self.updated_at = now();
        Ok(true)
    }

    /// Move to `next` if the state machine allows it.
    pub fn transition_to(&mut self, next: TransactionState) -> std::result::Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = now();
        Ok(())
    }

    /// Participants that have not acknowledged commit yet.
    pub fn pending_commit(&self) -> Vec<SharedParticipant> {
        self.participants
            .iter()
            .filter(|participant| !self.acknowledged.contains(participant.id()))
            .cloned()
            .collect()
    }

    pub fn mark_committed(&mut self, id: ParticipantId) {
        self.acknowledged.insert(id);
    }

    /// Every participant, including unresolved ones, acknowledged commit.
    pub fn is_commit_complete(&self) -> bool {
        self.unresolved.is_empty()
            && self
                .participants
                .iter()
                .all(|participant| self.acknowledged.contains(participant.id()))
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("participants", &self.participant_ids())
            .field("acknowledged", &self.acknowledged.len())
            .finish()
    }
}
