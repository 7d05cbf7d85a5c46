//! Metrics collection for coordinator monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Coordinator metrics.
pub struct Metrics {
    /// Transactions created by `begin`.
    pub transactions_begun: AtomicU64,
    /// Transactions that reached COMMITTED.
    pub transactions_committed: AtomicU64,
    /// Transactions that reached ABORTED.
    pub transactions_aborted: AtomicU64,
    /// Commit phases that ended with unacknowledged participants.
    pub commit_failures: AtomicU64,
    /// Prepare calls answered with an abort vote or an error.
    pub prepare_rejections: AtomicU64,
    /// Prepare calls that exceeded their budget.
    pub prepare_timeouts: AtomicU64,
    /// Phase-two participant calls that were retried.
    pub participant_retries: AtomicU64,
    /// Participant rollbacks that failed after all retries.
    pub rollback_failures: AtomicU64,
    /// Transactions committed by recovery.
    pub recovered_committed: AtomicU64,
    /// Transactions rolled back by recovery.
    pub recovered_aborted: AtomicU64,
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            transactions_begun: AtomicU64::new(0),
            transactions_committed: AtomicU64::new(0),
            transactions_aborted: AtomicU64::new(0),
            commit_failures: AtomicU64::new(0),
            prepare_rejections: AtomicU64::new(0),
            prepare_timeouts: AtomicU64::new(0),
            participant_retries: AtomicU64::new(0),
            rollback_failures: AtomicU64::new(0),
            recovered_committed: AtomicU64::new(0),
            recovered_aborted: AtomicU64::new(0),
        }
    }

    pub fn transaction_begun(&self) {
        self.transactions_begun.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transaction_committed(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transaction_aborted(&self) {
        self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn commit_failed(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn prepare_rejected(&self) {
        self.prepare_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn prepare_timed_out(&self) {
        self.prepare_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn participant_retried(&self) {
        self.participant_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rollback_failed(&self) {
        self.rollback_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recovered_commit(&self) {
        self.recovered_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recovered_abort(&self) {
        self.recovered_aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transactions_begun: self.transactions_begun.load(Ordering::Relaxed),
            transactions_committed: self.transactions_committed.load(Ordering::Relaxed),
            transactions_aborted: self.transactions_aborted.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            prepare_rejections: self.prepare_rejections.load(Ordering::Relaxed),
            prepare_timeouts: self.prepare_timeouts.load(Ordering::Relaxed),
            participant_retries: self.participant_retries.load(Ordering::Relaxed),
            rollback_failures: self.rollback_failures.load(Ordering::Relaxed),
            recovered_committed: self.recovered_committed.load(Ordering::Relaxed),
            recovered_aborted: self.recovered_aborted.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let series: [(&str, &str, &str, u64); 10] = [
            ("transactions_begun", "counter", "Transactions created", snapshot.transactions_begun),
            ("transactions_committed", "counter", "Transactions committed", snapshot.transactions_committed),
            ("transactions_aborted", "counter", "Transactions rolled back", snapshot.transactions_aborted),
            ("commit_failures", "counter", "Commit phases left incomplete", snapshot.commit_failures),
            ("prepare_rejections", "counter", "Prepare calls voting abort or failing", snapshot.prepare_rejections),
            ("prepare_timeouts", "counter", "Prepare calls exceeding their budget", snapshot.prepare_timeouts),
            ("participant_retries", "counter", "Retried phase-two participant calls", snapshot.participant_retries),
            ("rollback_failures", "counter", "Participant rollbacks that never succeeded", snapshot.rollback_failures),
            ("recovered_committed", "counter", "Transactions committed by recovery", snapshot.recovered_committed),
            ("recovered_aborted", "counter", "Transactions rolled back by recovery", snapshot.recovered_aborted),
        ];

        let mut output = String::new();
        for (name, kind, help, value) in series {
            output.push_str(&format!(
                "# HELP twophase_{name} {help}\n# TYPE twophase_{name} {kind}\ntwophase_{name} {value}\n\n"
            ));
        }
        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub transactions_begun: u64,
    pub transactions_committed: u64,
    pub transactions_aborted: u64,
    pub commit_failures: u64,
    pub prepare_rejections: u64,
    pub prepare_timeouts: u64,
    pub participant_retries: u64,
    pub rollback_failures: u64,
    pub recovered_committed: u64,
    pub recovered_aborted: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;
