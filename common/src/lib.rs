//! TwoPhase Common Types
//!
//! Shared types used by the coordinator and its participants: identifiers,
//! the transaction state machine, votes and decisions, and the error taxonomy.

pub mod identifiers;
pub mod state;
pub mod decision;
pub mod error;
pub mod time;

pub use identifiers::*;
pub use state::*;
pub use decision::*;
pub use error::*;
pub use time::*;
