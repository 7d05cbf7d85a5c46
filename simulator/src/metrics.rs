//! Simulation metrics.

use std::collections::VecDeque;

use crate::scenario::TransferOutcome;

/// Simulation metrics.
#[derive(Debug, Clone)]
pub struct SimulationMetrics {
    /// Total transfers attempted.
    pub total_transfers: u64,
    /// Transfers committed.
    pub committed_transfers: u64,
    /// Transfers rolled back.
    pub aborted_transfers: u64,
    /// Transfers left waiting on commit or recovery.
    pub pending_transfers: u64,
    /// Latency samples (ms).
    latency_samples: VecDeque<u64>,
    /// Maximum samples to keep.
    max_samples: usize,
}

impl SimulationMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            total_transfers: 0,
            committed_transfers: 0,
            aborted_transfers: 0,
            pending_transfers: 0,
            latency_samples: VecDeque::with_capacity(10000),
            max_samples: 10000,
        }
    }

    /// Record how a transfer ended and how long it took.
    pub fn record(&mut self, outcome: TransferOutcome, latency_ms: u64) {
        self.total_transfers += 1;
        match outcome {
            TransferOutcome::Committed => self.committed_transfers += 1,
            TransferOutcome::Aborted => self.aborted_transfers += 1,
            TransferOutcome::Incomplete | TransferOutcome::Prepared => self.pending_transfers += 1,
        }

        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_ms);
    }

    /// Get average latency in ms.
    pub fn average_latency_ms(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    /// Get p50 latency.
    pub fn p50_latency_ms(&self) -> u64 {
        self.percentile_latency(50)
    }

    /// Get p99 latency.
    pub fn p99_latency_ms(&self) -> u64 {
        self.percentile_latency(99)
    }

    fn percentile_latency(&self, percentile: usize) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let mut sorted: Vec<_> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Share of transfers that committed.
    pub fn commit_rate(&self) -> f64 {
        if self.total_transfers == 0 {
            return 0.0;
        }

        self.committed_transfers as f64 / self.total_transfers as f64
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}
