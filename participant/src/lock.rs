//! Exclusive resource locks with bounded acquisition for participants.
//!
//! Two transactions touching the same resource (an account, a stock item)
//! serialize here. A transaction that cannot get its lock within its budget
//! fails prepare, which turns a lock-ordering cycle into an ordinary abort.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use twophase_common::{ParticipantError, ParticipantResult, TransactionId};

/// Lock table configuration.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Longest a lock may be held before it is considered abandoned.
    pub max_hold: Duration,
    /// Lock cleanup interval.
    pub cleanup_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_hold: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(1),
        }
    }
}

/// A held lock on one resource.
#[derive(Debug, Clone)]
pub struct ResourceLock {
    /// Locked resource key.
    pub resource: String,
    /// Transaction holding the lock.
    pub owner: TransactionId,
    /// When the lock was acquired.
    pub acquired_at: Instant,
    /// When the lock is considered abandoned.
    pub expires_at: Instant,
}

impl ResourceLock {
    fn new(resource: String, owner: TransactionId, max_hold: Duration) -> Self {
        let now = Instant::now();
        Self {
            resource,
            owner,
            acquired_at: now,
            expires_at: now + max_hold,
        }
    }

    /// Check if lock has expired.
    pub fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }

    /// Get remaining time until expiry.
    pub fn remaining_time(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Table of exclusive locks keyed by resource.
pub struct ResourceLocks {
    /// Held locks by resource.
    locks: Arc<DashMap<String, ResourceLock>>,
    /// Resources held per transaction.
    locks_by_owner: Arc<DashMap<TransactionId, Vec<String>>>,
    /// Woken whenever a lock is released.
    released: Notify,
    /// Configuration.
    config: LockConfig,
}

impl ResourceLocks {
    /// Create a new lock table.
    pub fn new(config: LockConfig) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            locks_by_owner: Arc::new(DashMap::new()),
            released: Notify::new(),
            config,
        }
    }

    /// Acquire `resource` for `owner`, waiting at most `timeout`.
    ///
    /// Re-acquiring a lock the owner already holds succeeds immediately.
    pub async fn acquire(
        &self,
        resource: &str,
        owner: TransactionId,
        timeout: Duration,
    ) -> ParticipantResult<()> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register for wake-ups before checking so a release in between is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_acquire(resource, owner) {
                return Ok(());
            }

            if tokio::time::timeout_at(deadline, notified.as_mut()).await.is_err() {
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(
                    resource = %resource,
                    tx_id = %owner,
                    holder = ?self.holder(resource),
                    waited_ms,
                    "Lock acquisition timed out"
                );
                return Err(ParticipantError::LockTimeout {
                    resource: resource.to_string(),
                    waited_ms,
                });
            }
        }
    }

    /// Try to take the lock without waiting.
    pub fn try_acquire(&self, resource: &str, owner: TransactionId) -> bool {
        let acquired = match self.locks.entry(resource.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().owner == owner {
                    return true;
                }
                if !entry.get().is_expired() {
                    return false;
                }
                let stale = entry.insert(ResourceLock::new(
                    resource.to_string(),
                    owner,
                    self.config.max_hold,
                ));
                warn!(
                    resource = %resource,
                    stale_owner = %stale.owner,
                    tx_id = %owner,
                    "Took over expired lock"
                );
                self.forget(stale.owner, resource);
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(ResourceLock::new(
                    resource.to_string(),
                    owner,
                    self.config.max_hold,
                ));
                true
            }
        };

        if acquired {
            self.locks_by_owner
                .entry(owner)
                .or_default()
                .push(resource.to_string());
            debug!(resource = %resource, tx_id = %owner, "Lock acquired");
        }
        acquired
    }

    /// Release one lock if `owner` holds it.
    pub fn release(&self, resource: &str, owner: TransactionId) -> bool {
        let removed = self
            .locks
            .remove_if(resource, |_, lock| lock.owner == owner)
            .is_some();
        if removed {
            self.forget(owner, resource);
            self.released.notify_waiters();
            debug!(resource = %resource, tx_id = %owner, "Lock released");
        }
        removed
    }

    /// Release every lock held by `owner`.
    pub fn release_all(&self, owner: TransactionId) -> usize {
        let resources = self
            .locks_by_owner
            .remove(&owner)
            .map(|(_, resources)| resources)
            .unwrap_or_default();

        let released = resources
            .iter()
            .filter(|resource| {
                self.locks
                    .remove_if(resource.as_str(), |_, lock| lock.owner == owner)
                    .is_some()
            })
            .count();

        if released > 0 {
            self.released.notify_waiters();
            info!(tx_id = %owner, released, "Locks released");
        }
        released
    }

    /// Current holder of a resource, if any.
    pub fn holder(&self, resource: &str) -> Option<TransactionId> {
        self.locks.get(resource).map(|lock| lock.owner)
    }

    /// Get a held lock.
    pub fn get_lock(&self, resource: &str) -> Option<ResourceLock> {
        self.locks.get(resource).map(|lock| lock.clone())
    }

    /// Resources currently held by `owner`.
    pub fn held_by(&self, owner: TransactionId) -> Vec<String> {
        self.locks_by_owner
            .get(&owner)
            .map(|resources| resources.clone())
            .unwrap_or_default()
    }

    /// Get count of held locks.
    pub fn active_lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Run cleanup loop to release abandoned locks.
    pub async fn run_cleanup_loop(&self) {
        loop {
            tokio::time::sleep(self.config.cleanup_interval).await;
            self.expire_stale();
        }
    }

    /// Release locks held past `max_hold`.
    pub fn expire_stale(&self) -> usize {
        let expired: Vec<(String, TransactionId)> = self
            .locks
            .iter()
            .filter(|lock| lock.is_expired())
            .map(|lock| (lock.resource.clone(), lock.owner))
            .collect();

        let mut count = 0;
        for (resource, owner) in expired {
            if self
                .locks
                .remove_if(&resource, |_, lock| lock.owner == owner && lock.is_expired())
                .is_some()
            {
                self.forget(owner, &resource);
                warn!(resource = %resource, tx_id = %owner, "Lock expired");
                count += 1;
            }
        }

        if count > 0 {
            self.released.notify_waiters();
        }
        count
    }

    fn forget(&self, owner: TransactionId, resource: &str) {
        let now_empty = match self.locks_by_owner.get_mut(&owner) {
            Some(mut resources) => {
                resources.retain(|held| held != resource);
                resources.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.locks_by_owner.remove_if(&owner, |_, resources| resources.is_empty());
        }
    }
}

impl Default for ResourceLocks {
    fn default() -> Self {
        Self::new(LockConfig::default())
    }
}
