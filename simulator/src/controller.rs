//! Simulation controller.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, ensure, Context};
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{info, warn};

use twophase_coordinator::{
    CoordinatorConfig, MetricsSnapshot, ParticipantRegistry, RecoveryReport,
    TransactionCoordinator,
};
use twophase_participant::{LockConfig, ResourceLocks, SharedParticipant};

use crate::bank::{BankFactory, SimulatedBank};
use crate::metrics::SimulationMetrics;
use crate::scenario::{AssertCondition, FaultType, Scenario, ScenarioStep, Transfer, TransferOutcome};

/// Simulation settings.
#[derive(Debug, Clone)]
pub struct SimulationSettings {
    /// Number of banks.
    pub bank_count: usize,
    /// Simulation speed multiplier.
    pub speed: f64,
    /// Random seed.
    pub seed: Option<u64>,
    /// Starting balance of every bank.
    pub initial_balance: Decimal,
    /// How long a bank waits for its account lock during prepare.
    pub lock_timeout: Duration,
    /// Chance that a random-mode transfer runs with an injected fault.
    pub fault_rate: f64,
    /// Coordinator configuration.
    pub coordinator: CoordinatorConfig,
}

/// Controls the simulation.
pub struct SimulationController {
    settings: SimulationSettings,
    /// Random number generator.
    rng: Arc<RwLock<StdRng>>,
    /// Simulated banks.
    banks: Vec<Arc<SimulatedBank>>,
    locks: Arc<ResourceLocks>,
    registry: Arc<ParticipantRegistry>,
    /// Replaced when the coordinator is restarted.
    coordinator: RwLock<Arc<TransactionCoordinator>>,
    /// Simulation metrics.
    metrics: Arc<RwLock<SimulationMetrics>>,
    /// Outcomes of the most recent transfer step.
    last_outcomes: RwLock<Vec<TransferOutcome>>,
}

impl SimulationController {
    /// Create the banks and a coordinator over a file decision log.
    ///
    /// Without a configured log path a fresh file in the temp directory is used.
    pub fn new(mut settings: SimulationSettings) -> anyhow::Result<Self> {
        ensure!(settings.bank_count >= 2, "a simulation needs at least 2 banks");
        ensure!(settings.speed > 0.0, "speed must be positive");

        if settings.coordinator.decision_log_path.is_none() {
            settings.coordinator.decision_log_path = Some(default_log_path());
        }

        let rng = match settings.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        let locks = Arc::new(ResourceLocks::new(LockConfig::default()));
        let banks = BankFactory::create_banks(
            settings.bank_count,
            settings.initial_balance,
            locks.clone(),
            settings.lock_timeout,
        );

        let registry = Arc::new(ParticipantRegistry::new());
        for bank in &banks {
            let participant: SharedParticipant = bank.clone();
            registry.register(participant);
        }

        let coordinator =
            TransactionCoordinator::open(settings.coordinator.clone(), registry.clone())
                .context("Failed to open coordinator")?;

        Ok(Self {
            settings,
            rng: Arc::new(RwLock::new(rng)),
            banks,
            locks,
            registry,
            coordinator: RwLock::new(Arc::new(coordinator)),
            metrics: Arc::new(RwLock::new(SimulationMetrics::new())),
            last_outcomes: RwLock::new(Vec::new()),
        })
    }

    /// Start the coordinator and background tasks.
    pub async fn initialize(&self) -> anyhow::Result<RecoveryReport> {
        info!(
            banks = self.banks.len(),
            initial_balance = %self.settings.initial_balance,
            decision_log = ?self.settings.coordinator.decision_log_path,
            "Initializing simulation"
        );

        for bank in &self.banks {
            info!(bank = %bank.id_str(), name = bank.name(), balance = %bank.balance(), "Bank ready");
        }

        let locks = self.locks.clone();
        tokio::spawn(async move {
            locks.run_cleanup_loop().await;
        });

        let report = self.coordinator().await.start().await?;
        Ok(report)
    }

    /// Run a scenario.
    pub async fn run_scenario(&self, scenario: Scenario) -> anyhow::Result<()> {
        info!("Running scenario: {} - {}", scenario.name, scenario.description);

        for (index, step) in scenario.steps.iter().enumerate() {
            self.execute_step(step)
                .await
                .with_context(|| format!("Step {} of {} failed", index + 1, scenario.name))?;
        }

        info!(scenario = %scenario.name, "Scenario passed");
        Ok(())
    }

    /// Run random transfers until `duration` elapses or Ctrl+C.
    pub async fn run(&self, duration: Option<Duration>) -> anyhow::Result<()> {
        info!("Running simulation in continuous mode");

        let deadline = duration.map(|d| Instant::now() + d);
        let delay = Duration::from_millis((1000.0 / self.settings.speed) as u64);

        loop {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                break;
            }

            let (transfer, fault) = self.random_transfer().await;
            if let Some((bank, fault)) = &fault {
                bank.inject(fault);
            }

            tokio::select! {
                result = self.transfer(&transfer) => {
                    if let Err(e) = result {
                        warn!(error = %e, "Transfer failed");
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }

            if let Some((bank, _)) = &fault {
                bank.clear_faults();
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        Ok(())
    }

    /// Run one transfer through prepare and commit.
    pub async fn transfer(&self, transfer: &Transfer) -> anyhow::Result<TransferOutcome> {
        self.execute_transfer(transfer, true).await
    }

    /// Current coordinator.
    pub async fn coordinator(&self) -> Arc<TransactionCoordinator> {
        self.coordinator.read().await.clone()
    }

    /// Simulate a crash: drop the coordinator and recover with a new one.
    pub async fn restart_coordinator(&self) -> anyhow::Result<RecoveryReport> {
        warn!("Restarting coordinator without shutdown");

        let replacement = {
            let mut current = self.coordinator.write().await;
            let replacement = Arc::new(
                TransactionCoordinator::open(self.settings.coordinator.clone(), self.registry.clone())
                    .context("Failed to reopen coordinator")?,
            );
            *current = replacement.clone();
            replacement
        };

        let report = replacement.start().await?;
        info!(
            committed = report.committed.len(),
            aborted = report.aborted.len(),
            incomplete = report.incomplete.len(),
            "Coordinator recovered"
        );
        Ok(report)
    }

    /// Get simulation metrics.
    pub async fn metrics(&self) -> SimulationMetrics {
        self.metrics.read().await.clone()
    }

    /// Get coordinator metrics.
    pub async fn coordinator_metrics(&self) -> MetricsSnapshot {
        self.coordinator().await.metrics().snapshot()
    }

    /// Stop the coordinator.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.coordinator().await.stop().await?;
        Ok(())
    }

    /// Balances by bank ID.
    pub fn balances(&self) -> Vec<(String, Decimal)> {
        self.banks
            .iter()
            .map(|bank| (bank.id_str().to_string(), bank.balance()))
            .collect()
    }

    async fn execute_transfer(
        &self,
        transfer: &Transfer,
        finish: bool,
    ) -> anyhow::Result<TransferOutcome> {
        let from = self.bank(&transfer.from_bank)?;
        let to = self.bank(&transfer.to_bank)?;
        let amount = Decimal::from_str_exact(&transfer.amount)
            .with_context(|| format!("Invalid amount {}", transfer.amount))?;
        ensure!(amount > Decimal::ZERO, "amount must be positive");

        let coordinator = self.coordinator().await;
        let started = Instant::now();

        let tx_id = coordinator.begin()?;
        from.stage(tx_id, -amount);
        to.stage(tx_id, amount);
        coordinator.enlist(tx_id, from.clone())?;
        coordinator.enlist(tx_id, to.clone())?;

        let outcome = if !coordinator.prepare(tx_id).await? {
            TransferOutcome::Aborted
        } else if !finish {
            TransferOutcome::Prepared
        } else if coordinator.commit(tx_id).await? {
            TransferOutcome::Committed
        } else {
            TransferOutcome::Incomplete
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        self.metrics.write().await.record(outcome, latency_ms);

        info!(
            tx_id = %tx_id,
            from = %transfer.from_bank,
            to = %transfer.to_bank,
            amount = %amount,
            outcome = ?outcome,
            latency_ms,
            "Transfer finished"
        );
        Ok(outcome)
    }

    /// Execute a single scenario step.
    async fn execute_step(&self, step: &ScenarioStep) -> anyhow::Result<()> {
        match step {
            ScenarioStep::Wait { millis } => {
                let adjusted = (*millis as f64 / self.settings.speed) as u64;
                info!("Waiting {}ms (adjusted: {}ms)", millis, adjusted);
                tokio::time::sleep(Duration::from_millis(adjusted)).await;
            }
            ScenarioStep::Transfer(transfer) => {
                let outcome = self.transfer(transfer).await?;
                *self.last_outcomes.write().await = vec![outcome];
            }
            ScenarioStep::Concurrent {
                transfers,
                stagger_ms,
            } => {
                let runs = transfers.iter().enumerate().map(|(i, transfer)| async move {
                    tokio::time::sleep(Duration::from_millis(stagger_ms * i as u64)).await;
                    self.transfer(transfer).await
                });
                let outcomes = join_all(runs)
                    .await
                    .into_iter()
                    .collect::<anyhow::Result<Vec<_>>>()?;
                *self.last_outcomes.write().await = outcomes;
            }
            ScenarioStep::PrepareOnly(transfer) => {
                let outcome = self.execute_transfer(transfer, false).await?;
                *self.last_outcomes.write().await = vec![outcome];
            }
            ScenarioStep::RestartCoordinator => {
                self.restart_coordinator().await?;
            }
            ScenarioStep::InjectFault { fault_type, target } => {
                self.bank(target)?.inject(fault_type);
            }
            ScenarioStep::ClearFault { target } => {
                self.bank(target)?.clear_faults();
            }
            ScenarioStep::Assert { condition } => {
                self.check(condition).await?;
                info!("Assertion held: {:?}", condition);
            }
        }

        Ok(())
    }

    async fn check(&self, condition: &AssertCondition) -> anyhow::Result<()> {
        match condition {
            AssertCondition::Outcomes { expected } => {
                let actual = self.last_outcomes.read().await.clone();
                ensure!(
                    &actual == expected,
                    "expected outcomes {:?}, got {:?}",
                    expected,
                    actual
                );
            }
            AssertCondition::BalanceEquals { bank, amount } => {
                let expected = Decimal::from_str_exact(amount)
                    .with_context(|| format!("Invalid amount {amount}"))?;
                let actual = self.bank(bank)?.balance();
                ensure!(
                    actual == expected,
                    "{bank} balance is {actual}, expected {expected}"
                );
            }
            AssertCondition::TotalConserved => {
                let expected = self.settings.initial_balance * Decimal::from(self.banks.len());
                let actual: Decimal = self.banks.iter().map(|bank| bank.balance()).sum();
                ensure!(
                    actual == expected,
                    "total balance is {actual}, expected {expected}"
                );
            }
        }
        Ok(())
    }

    async fn random_transfer(&self) -> (Transfer, Option<(Arc<SimulatedBank>, FaultType)>) {
        let mut rng = self.rng.write().await;

        let from = rng.gen_range(0..self.banks.len());
        let mut to = rng.gen_range(0..self.banks.len());
        while to == from {
            to = rng.gen_range(0..self.banks.len());
        }
        let amount = rng.gen_range(1_000..200_000);

        let fault = if rng.gen_bool(self.settings.fault_rate.clamp(0.0, 1.0)) {
            let target = self.banks[if rng.gen_bool(0.5) { from } else { to }].clone();
            let fault = match rng.gen_range(0..3) {
                0 => FaultType::ForceAbort,
                1 => FaultType::CommitFailures { count: 1 },
                _ => FaultType::Latency { delay_ms: 50 },
            };
            Some((target, fault))
        } else {
            None
        };

        let transfer = Transfer::new(
            self.banks[from].id_str(),
            self.banks[to].id_str(),
            &amount.to_string(),
        );
        (transfer, fault)
    }

    fn bank(&self, id: &str) -> anyhow::Result<Arc<SimulatedBank>> {
        self.banks
            .iter()
            .find(|bank| bank.id_str() == id)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown bank: {id}"))
    }
}

fn default_log_path() -> PathBuf {
    std::env::temp_dir().join(format!(
        "twophase-simulator-{}.log",
        uuid::Uuid::new_v4().simple()
    ))
}
