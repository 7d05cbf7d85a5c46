//! Coordinator configuration.

use std::path::PathBuf;
use std::time::Duration;

use twophase_common::constants::{
    DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_DRAIN_TIMEOUT, DEFAULT_PREPARE_TIMEOUT,
    DEFAULT_RETRY_ATTEMPTS,
};
use twophase_common::{backoff_delay, Result, TwoPhaseError};

/// Retry policy for phase-two participant calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts per participant, including the first call.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for each further retry.
    pub backoff_base: Duration,
    /// Cap on a single retry delay.
    pub backoff_max: Duration,
    /// Budget for each individual attempt.
    pub call_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            call_timeout: DEFAULT_PREPARE_TIMEOUT,
        }
    }
}

impl RetryConfig {
    /// Delay to wait before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        backoff_delay(self.backoff_base, self.backoff_max, retry)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(TwoPhaseError::Configuration(format!(
                "{name} retry attempts cannot be 0"
            )));
        }
        if self.backoff_base > self.backoff_max {
            return Err(TwoPhaseError::Configuration(format!(
                "{name} backoff base cannot exceed backoff max"
            )));
        }
        if self.call_timeout.is_zero() {
            return Err(TwoPhaseError::Configuration(format!(
                "{name} call timeout cannot be 0"
            )));
        }
        Ok(())
    }
}

/// Main coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Node ID used in logs.
    pub node_id: Option<String>,
    /// Budget for each participant's prepare call.
    pub prepare_timeout: Duration,
    /// Commit retry policy.
    pub commit_retry: RetryConfig,
    /// Rollback retry policy.
    pub rollback_retry: RetryConfig,
    /// Decision log file. `None` keeps decisions in memory only.
    pub decision_log_path: Option<PathBuf>,
    /// Drop terminal transactions from the live table.
    pub evict_terminal: bool,
    /// How long `stop` waits for in-flight phases.
    pub drain_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            prepare_timeout: DEFAULT_PREPARE_TIMEOUT,
            commit_retry: RetryConfig::default(),
            rollback_retry: RetryConfig::default(),
            decision_log_path: None,
            evict_terminal: true,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(timeout) = std::env::var("TWOPHASE_PREPARE_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                config.prepare_timeout = Duration::from_millis(ms);
            }
        }

        if let Ok(attempts) = std::env::var("TWOPHASE_RETRY_ATTEMPTS") {
            if let Ok(attempts) = attempts.parse() {
                config.commit_retry.max_attempts = attempts;
                config.rollback_retry.max_attempts = attempts;
            }
        }

        if let Ok(backoff) = std::env::var("TWOPHASE_RETRY_BACKOFF_MS") {
            if let Ok(ms) = backoff.parse() {
                config.commit_retry.backoff_base = Duration::from_millis(ms);
                config.rollback_retry.backoff_base = Duration::from_millis(ms);
            }
        }

        if let Ok(path) = std::env::var("TWOPHASE_DECISION_LOG") {
            if !path.is_empty() {
                config.decision_log_path = Some(PathBuf::from(path));
            }
        }

        if let Ok(node_id) = std::env::var("TWOPHASE_NODE_ID") {
            config.node_id = Some(node_id);
        }

        config
    }

    /// Use the same per-call budget for prepare and for every phase-two attempt.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.prepare_timeout = timeout;
        self.commit_retry.call_timeout = timeout;
        self.rollback_retry.call_timeout = timeout;
        self
    }

    /// Use the same retry backoff base for commit and rollback.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.commit_retry.backoff_base = base;
        self.rollback_retry.backoff_base = base;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.prepare_timeout.is_zero() {
            return Err(TwoPhaseError::Configuration(
                "Prepare timeout cannot be 0".to_string(),
            ));
        }

        self.commit_retry.validate("Commit")?;
        self.rollback_retry.validate("Rollback")?;

        Ok(())
    }
}
