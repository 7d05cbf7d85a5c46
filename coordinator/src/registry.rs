//! Participant lookup by ID.
//!
//! Recovery only has participant IDs from the decision log; the registry
//! turns them back into callable participants.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use twophase_common::ParticipantId;
use twophase_participant::SharedParticipant;

/// Registry of participants known to this coordinator.
pub struct ParticipantRegistry {
    participants: Arc<DashMap<ParticipantId, SharedParticipant>>,
}

impl ParticipantRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            participants: Arc::new(DashMap::new()),
        }
    }

    /// Register a participant, replacing any previous one with the same ID.
    pub fn register(&self, participant: SharedParticipant) -> Option<SharedParticipant> {
        let id = participant.id().clone();
        let previous = self.participants.insert(id.clone(), participant);
        info!(participant_id = %id, replaced = previous.is_some(), "Participant registered");
        previous
    }

    /// Register a participant unless one with the same ID is already known.
    pub fn register_if_absent(&self, participant: &SharedParticipant) -> bool {
        let mut inserted = false;
        self.participants
            .entry(participant.id().clone())
            .or_insert_with(|| {
                inserted = true;
                participant.clone()
            });
        inserted
    }

    /// Unregister a participant.
    pub fn unregister(&self, id: &ParticipantId) -> Option<SharedParticipant> {
        let removed = self.participants.remove(id).map(|(_, participant)| participant);
        if removed.is_some() {
            info!(participant_id = %id, "Participant unregistered");
        }
        removed
    }

    /// Get a participant by ID.
    pub fn get(&self, id: &ParticipantId) -> Option<SharedParticipant> {
        self.participants.get(id).map(|entry| entry.value().clone())
    }

    /// Check if a participant is registered.
    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.participants.contains_key(id)
    }

    /// Resolve IDs, keeping order. Returns the found participants and the missing IDs.
    pub fn resolve(&self, ids: &[ParticipantId]) -> (Vec<SharedParticipant>, Vec<ParticipantId>) {
        let mut found = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            match self.get(id) {
                Some(participant) => found.push(participant),
                None => missing.push(id.clone()),
            }
        }
        (found, missing)
    }

    /// Get all participant IDs.
    pub fn ids(&self) -> Vec<ParticipantId> {
        self.participants.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

impl Default for ParticipantRegistry {
    fn default() -> Self {
        Self::new()
    }
}
