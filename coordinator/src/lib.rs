//! TwoPhase Coordinator
//!
//! Drives transactions across independent participants with two-phase
//! commit: concurrent prepare with a per-call timeout, commit with retry,
//! best-effort rollback, a durable decision log and restart recovery.

pub mod config;
pub mod context;
pub mod coordinator;
pub mod decision_log;
pub mod fanout;
pub mod metrics;
pub mod recovery;
pub mod registry;
pub mod state;

pub use config::{CoordinatorConfig, RetryConfig};
pub use context::TransactionContext;
pub use coordinator::TransactionCoordinator;
pub use decision_log::{DecisionLog, DecisionLogEntry, FileDecisionLog, MemoryDecisionLog};
pub use metrics::{Metrics, MetricsSnapshot, SharedMetrics};
pub use recovery::RecoveryReport;
pub use registry::ParticipantRegistry;
pub use state::CoordinatorState;
