//! TwoPhase Participant Library
//!
//! The capability set a resource manager implements to take part in a
//! two-phase commit, plus participant-side helpers: a resource lock table
//! with bounded acquisition and a scripted participant for tests and
//! simulations.

pub mod participant;
pub mod lock;
pub mod scripted;

pub use participant::{LoggingParticipant, Participant, SharedParticipant};
pub use lock::{LockConfig, ResourceLock, ResourceLocks};
pub use scripted::{CallKind, CallRecord, ScriptedParticipant};
