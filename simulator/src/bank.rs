//! Simulated bank participant.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use twophase_common::{ParticipantError, ParticipantId, ParticipantResult, TransactionId, Vote};
use twophase_participant::{Participant, ResourceLocks};

use crate::scenario::FaultType;

/// Faults currently injected into a bank.
#[derive(Debug, Clone, Default)]
struct Faults {
    offline: bool,
    latency: Duration,
    force_abort: bool,
    /// Commit calls that fail before one succeeds.
    commit_failures: u32,
}

/// A simulated bank holding one settlement account.
///
/// Callers stage the balance change a transaction makes at this bank, then
/// enlist the bank. Prepare locks the account and reserves the change,
/// commit applies it and rollback discards it.
pub struct SimulatedBank {
    /// Bank identifier.
    id: ParticipantId,
    /// Bank name.
    name: String,
    balance: Mutex<Decimal>,
    /// Changes staged by callers, not yet prepared.
    staged: DashMap<TransactionId, Decimal>,
    /// Changes reserved by a successful prepare.
    reserved: DashMap<TransactionId, Decimal>,
    locks: Arc<ResourceLocks>,
    lock_timeout: Duration,
    faults: Mutex<Faults>,
}

impl SimulatedBank {
    /// Create a new simulated bank.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        initial_balance: Decimal,
        locks: Arc<ResourceLocks>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            id: ParticipantId::new(id),
            name: name.into(),
            balance: Mutex::new(initial_balance),
            staged: DashMap::new(),
            reserved: DashMap::new(),
            locks,
            lock_timeout,
            faults: Mutex::new(Faults::default()),
        }
    }

    pub fn id_str(&self) -> &str {
        self.id.as_str()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Settled balance.
    pub fn balance(&self) -> Decimal {
        *self.balance.lock()
    }

    /// Stage the balance change `tx_id` makes at this bank.
    pub fn stage(&self, tx_id: TransactionId, delta: Decimal) {
        *self.staged.entry(tx_id).or_insert(Decimal::ZERO) += delta;
    }

    /// Number of transactions holding a reservation.
    pub fn reservation_count(&self) -> usize {
        self.reserved.len()
    }

    /// Inject a fault.
    pub fn inject(&self, fault: &FaultType) {
        let mut faults = self.faults.lock();
        match fault {
            FaultType::BankOffline => faults.offline = true,
            FaultType::Latency { delay_ms } => faults.latency = Duration::from_millis(*delay_ms),
            FaultType::ForceAbort => faults.force_abort = true,
            FaultType::CommitFailures { count } => faults.commit_failures = *count,
        }
        info!(bank = %self.id, fault = ?fault, "Fault injected");
    }

    /// Clear every injected fault.
    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
        info!(bank = %self.id, "Faults cleared");
    }

    fn account(&self) -> String {
        format!("{}/settlement", self.id)
    }

    fn faults(&self) -> Faults {
        self.faults.lock().clone()
    }

    fn check_online(&self, faults: &Faults) -> ParticipantResult<()> {
        if faults.offline {
            return Err(ParticipantError::Unavailable(format!("{} is offline", self.id)));
        }
        Ok(())
    }

    fn discard(&self, tx_id: TransactionId) {
        self.staged.remove(&tx_id);
        self.reserved.remove(&tx_id);
        self.locks.release_all(tx_id);
    }
}

#[async_trait::async_trait]
impl Participant for SimulatedBank {
    fn id(&self) -> &ParticipantId {
        &self.id
    }

    async fn prepare(&self, tx_id: TransactionId) -> ParticipantResult<Vote> {
        let faults = self.faults();
        if !faults.latency.is_zero() {
            tokio::time::sleep(faults.latency).await;
        }
        self.check_online(&faults)?;

        if faults.force_abort {
            warn!(bank = %self.id, tx_id = %tx_id, "Forced abort vote");
            return Ok(Vote::Abort);
        }
        if self.reserved.contains_key(&tx_id) {
            return Ok(Vote::Commit);
        }

        let delta = self.staged.get(&tx_id).map(|d| *d).unwrap_or(Decimal::ZERO);
        self.locks
            .acquire(&self.account(), tx_id, self.lock_timeout)
            .await?;

        let balance = self.balance();
        if balance + delta < Decimal::ZERO {
            warn!(
                bank = %self.id,
                tx_id = %tx_id,
                balance = %balance,
                requested = %(-delta),
                "Insufficient funds"
            );
            self.locks.release_all(tx_id);
            return Ok(Vote::Abort);
        }

        self.reserved.insert(tx_id, delta);
        debug!(bank = %self.id, tx_id = %tx_id, delta = %delta, "Funds reserved");
        Ok(Vote::Commit)
    }

    async fn commit(&self, tx_id: TransactionId) -> ParticipantResult<()> {
        let faults = self.faults();
        if !faults.latency.is_zero() {
            tokio::time::sleep(faults.latency).await;
        }
        self.check_online(&faults)?;

        {
            let mut current = self.faults.lock();
            if current.commit_failures > 0 {
                current.commit_failures -= 1;
                return Err(ParticipantError::Internal(format!(
                    "{} ledger write failed",
                    self.id
                )));
            }
        }

        // A repeated commit finds nothing reserved and changes nothing.
        if let Some((_, delta)) = self.reserved.remove(&tx_id) {
            *self.balance.lock() += delta;
            debug!(bank = %self.id, tx_id = %tx_id, delta = %delta, "Reservation applied");
        }
        self.discard(tx_id);
        Ok(())
    }

    async fn rollback(&self, tx_id: TransactionId) -> ParticipantResult<()> {
        self.check_online(&self.faults())?;

        if self.reserved.contains_key(&tx_id) {
            debug!(bank = %self.id, tx_id = %tx_id, "Reservation released");
        }
        self.discard(tx_id);
        Ok(())
    }
}

/// Bank factory for creating test banks.
pub struct BankFactory;

impl BankFactory {
    /// Create N simulated banks sharing one lock table.
    pub fn create_banks(
        count: usize,
        initial_balance: Decimal,
        locks: Arc<ResourceLocks>,
        lock_timeout: Duration,
    ) -> Vec<Arc<SimulatedBank>> {
        let bank_names = [
            ("BANK_A", "Alpha Bank"),
            ("BANK_B", "Beta Financial"),
            ("BANK_C", "Central Trust"),
            ("BANK_D", "Delta Holdings"),
            ("BANK_E", "Eastern Bank"),
            ("BANK_F", "First National"),
            ("BANK_G", "Global Finance"),
            ("BANK_H", "Harbor Bank"),
            ("BANK_I", "International Trust"),
            ("BANK_J", "Jade Financial"),
        ];

        (0..count)
            .map(|i| {
                let (id, name) = match bank_names.get(i) {
                    Some((id, name)) => (id.to_string(), name.to_string()),
                    None => (format!("BANK_{}", i + 1), format!("Bank {}", i + 1)),
                };
                Arc::new(SimulatedBank::new(
                    id,
                    name,
                    initial_balance,
                    locks.clone(),
                    lock_timeout,
                ))
            })
            .collect()
    }
}
