//! Simulation scenarios.

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Steps in the scenario.
    pub steps: Vec<ScenarioStep>,
}

/// One leg-pair transfer between two banks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub from_bank: String,
    pub to_bank: String,
    pub amount: String,
}

impl Transfer {
    pub fn new(from_bank: &str, to_bank: &str, amount: &str) -> Self {
        Self {
            from_bank: from_bank.to_string(),
            to_bank: to_bank.to_string(),
            amount: amount.to_string(),
        }
    }
}

/// How a transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferOutcome {
    Committed,
    Aborted,
    /// Commit retries ran out; the transaction awaits recovery.
    Incomplete,
    /// Prepared and deliberately left undecided.
    Prepared,
}

/// A step in a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScenarioStep {
    /// Wait for a duration.
    Wait { millis: u64 },
    /// Run one transfer to completion.
    Transfer(Transfer),
    /// Start several transfers, each `stagger_ms` after the previous one.
    Concurrent {
        transfers: Vec<Transfer>,
        stagger_ms: u64,
    },
    /// Prepare a transfer and stop before commit.
    PrepareOnly(Transfer),
    /// Drop the coordinator without stopping it and start a new one over the same log.
    RestartCoordinator,
    /// Inject a fault.
    InjectFault { fault_type: FaultType, target: String },
    /// Clear a fault.
    ClearFault { target: String },
    /// Assert a condition.
    Assert { condition: AssertCondition },
}

/// Types of faults that can be injected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FaultType {
    /// Bank goes offline.
    BankOffline,
    /// Added latency on prepare and commit.
    Latency { delay_ms: u64 },
    /// Bank votes abort on every prepare.
    ForceAbort,
    /// The next `count` commit calls fail.
    CommitFailures { count: u32 },
}

/// Conditions that can be asserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AssertCondition {
    /// Outcomes of the most recent transfer step, in start order.
    Outcomes { expected: Vec<TransferOutcome> },
    /// Bank balance equals.
    BalanceEquals { bank: String, amount: String },
    /// Sum of all balances is unchanged from the start.
    TotalConserved,
}

impl Scenario {
    /// Load a built-in scenario by name, or a scenario from a `.json` file.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        if name.ends_with(".json") {
            let text = std::fs::read_to_string(name)
                .with_context(|| format!("Failed to read scenario file {name}"))?;
            return serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse scenario file {name}"));
        }

        match name {
            "simple-transfer" => Ok(Self::simple_transfer()),
            "insufficient-funds" => Ok(Self::insufficient_funds()),
            "slow-participant" => Ok(Self::slow_participant()),
            "contention" => Ok(Self::contention()),
            "crash-recovery" => Ok(Self::crash_recovery()),
            _ => Err(anyhow::anyhow!("Unknown scenario: {}", name)),
        }
    }

    /// Names accepted by [`Scenario::load`].
    pub fn names() -> &'static [&'static str] {
        &[
            "simple-transfer",
            "insufficient-funds",
            "slow-participant",
            "contention",
            "crash-recovery",
        ]
    }

    fn balance(bank: &str, amount: &str) -> ScenarioStep {
        ScenarioStep::Assert {
            condition: AssertCondition::BalanceEquals {
                bank: bank.to_string(),
                amount: amount.to_string(),
            },
        }
    }

    fn outcomes(expected: Vec<TransferOutcome>) -> ScenarioStep {
        ScenarioStep::Assert {
            condition: AssertCondition::Outcomes { expected },
        }
    }

    /// Both banks vote commit.
    fn simple_transfer() -> Self {
        Self {
            name: "simple-transfer".to_string(),
            description: "One transfer between two healthy banks".to_string(),
            steps: vec![
                ScenarioStep::Transfer(Transfer::new("BANK_A", "BANK_B", "250000")),
                Self::outcomes(vec![TransferOutcome::Committed]),
                Self::balance("BANK_A", "750000"),
                Self::balance("BANK_B", "1250000"),
                ScenarioStep::Assert {
                    condition: AssertCondition::TotalConserved,
                },
            ],
        }
    }

    /// The paying bank votes abort and both sides roll back.
    fn insufficient_funds() -> Self {
        Self {
            name: "insufficient-funds".to_string(),
            description: "Transfer larger than the payer's balance is rolled back".to_string(),
            steps: vec![
                ScenarioStep::Transfer(Transfer::new("BANK_A", "BANK_B", "5000000")),
                Self::outcomes(vec![TransferOutcome::Aborted]),
                Self::balance("BANK_A", "1000000"),
                Self::balance("BANK_B", "1000000"),
            ],
        }
    }

    /// A bank slower than the prepare timeout aborts the transfer.
    fn slow_participant() -> Self {
        Self {
            name: "slow-participant".to_string(),
            description: "Prepare timeout counts as an abort vote".to_string(),
            steps: vec![
                ScenarioStep::InjectFault {
                    fault_type: FaultType::Latency { delay_ms: 1500 },
                    target: "BANK_B".to_string(),
                },
                ScenarioStep::Transfer(Transfer::new("BANK_A", "BANK_B", "1000")),
                Self::outcomes(vec![TransferOutcome::Aborted]),
                ScenarioStep::ClearFault {
                    target: "BANK_B".to_string(),
                },
                ScenarioStep::Transfer(Transfer::new("BANK_A", "BANK_B", "1000")),
                Self::outcomes(vec![TransferOutcome::Committed]),
                Self::balance("BANK_A", "999000"),
            ],
        }
    }

    /// Two transfers compete for BANK_A's account; the later one times out on the lock.
    fn contention() -> Self {
        Self {
            name: "contention".to_string(),
            description: "Lock timeout on a contended account aborts the loser".to_string(),
            steps: vec![
                ScenarioStep::InjectFault {
                    fault_type: FaultType::Latency { delay_ms: 400 },
                    target: "BANK_B".to_string(),
                },
                ScenarioStep::Concurrent {
                    transfers: vec![
                        Transfer::new("BANK_A", "BANK_B", "100000"),
                        Transfer::new("BANK_A", "BANK_C", "100000"),
                    ],
                    stagger_ms: 50,
                },
                Self::outcomes(vec![TransferOutcome::Committed, TransferOutcome::Aborted]),
                ScenarioStep::ClearFault {
                    target: "BANK_B".to_string(),
                },
                Self::balance("BANK_A", "900000"),
                Self::balance("BANK_C", "1000000"),
                ScenarioStep::Assert {
                    condition: AssertCondition::TotalConserved,
                },
            ],
        }
    }

    /// The coordinator dies after prepare; the restarted one commits from the log.
    fn crash_recovery() -> Self {
        Self {
            name: "crash-recovery".to_string(),
            description: "Prepared transfer is committed by recovery after a restart".to_string(),
            steps: vec![
                ScenarioStep::PrepareOnly(Transfer::new("BANK_A", "BANK_B", "100000")),
                Self::outcomes(vec![TransferOutcome::Prepared]),
                Self::balance("BANK_A", "1000000"),
                ScenarioStep::RestartCoordinator,
                Self::balance("BANK_A", "900000"),
                Self::balance("BANK_B", "1100000"),
                ScenarioStep::Transfer(Transfer::new("BANK_B", "BANK_C", "50000")),
                Self::outcomes(vec![TransferOutcome::Committed]),
                ScenarioStep::Assert {
                    condition: AssertCondition::TotalConserved,
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_named_scenario_loads() {
        for name in Scenario::names() {
            let scenario = Scenario::load(name).unwrap();
            assert_eq!(scenario.name, *name);
            assert!(!scenario.steps.is_empty());
        }
        assert!(Scenario::load("does-not-exist").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.json");
        let scenario = Scenario::load("simple-transfer").unwrap();
        std::fs::write(&path, serde_json::to_string(&scenario).unwrap()).unwrap();

        let loaded = Scenario::load(path.to_str().unwrap()).unwrap();
        assert_eq!(loaded.name, "simple-transfer");
    }

    #[test]
    fn test_scenario_serializes() {
        let scenario = Scenario::load("contention").unwrap();
        let json = serde_json::to_string(&scenario).unwrap();
        let parsed: Scenario = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.steps.len(), scenario.steps.len());
    }
}
