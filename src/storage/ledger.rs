//! Account Ledger - the single writer of account capacity
//!
//! Each account has its own slot behind its own async lock, so capacity
//! checks and updates on one account are serialized while different
//! accounts never contend. A slot tracks two numbers:
//!
//! - `committed`: free bytes as persisted in the index
//! - `reserved`: bytes promised to chunks that are being uploaded
//!
//! What a new reservation may take is `committed - reserved`. Commits and
//! releases run the caller's persistence step while holding the slot lock,
//! so the persisted capacity always matches the ledger.

use super::{AccountId, BackingAccount, ChunkPlan, PlannedChunk, StorageError};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Free capacity of one account at snapshot time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCapacity {
    pub account_id: AccountId,
    pub available: u64,
}

#[derive(Debug)]
struct Slot {
    total: u64,
    committed: u64,
    reserved: u64,
}

impl Slot {
    fn available(&self) -> u64 {
        self.committed.saturating_sub(self.reserved)
    }
}

/// Per-account capacity ledger
#[derive(Default)]
pub struct AccountLedger {
    slots: DashMap<AccountId, Arc<Mutex<Slot>>>,
}

impl AccountLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a ledger from persisted accounts
    pub fn from_accounts<'a>(accounts: impl IntoIterator<Item = &'a BackingAccount>) -> Self {
        let ledger = Self::new();
        for account in accounts {
            ledger.register(account);
        }
        ledger
    }

    /// Start tracking an account. Re-registering replaces the slot.
    pub fn register(&self, account: &BackingAccount) {
        let slot = Slot {
            total: account.total_capacity,
            committed: account.available_capacity.min(account.total_capacity),
            reserved: 0,
        };
        self.slots.insert(account.id, Arc::new(Mutex::new(slot)));
    }

    fn slot(&self, account_id: &AccountId) -> Option<Arc<Mutex<Slot>>> {
        self.slots.get(account_id).map(|slot| Arc::clone(&slot))
    }

    /// Bytes a new reservation could take right now
    pub async fn available(&self, account_id: &AccountId) -> Option<u64> {
        let slot = self.slot(account_id)?;
        let guard = slot.lock().await;
        Some(guard.available())
    }

    /// Bytes currently held by in-flight reservations
    pub async fn reserved(&self, account_id: &AccountId) -> Option<u64> {
        let slot = self.slot(account_id)?;
        let guard = slot.lock().await;
        Some(guard.reserved)
    }

    /// Capacities of `accounts`, in the given order. Unknown accounts are skipped.
    pub async fn snapshot(&self, accounts: &[AccountId]) -> Vec<AccountCapacity> {
        let mut capacities = Vec::with_capacity(accounts.len());
        for account_id in accounts {
            if let Some(available) = self.available(account_id).await {
                capacities.push(AccountCapacity {
                    account_id: *account_id,
                    available,
                });
            }
        }
        capacities
    }

    /// Reserve `amount` bytes if they are still free
    pub async fn try_reserve(&self, account_id: &AccountId, amount: u64) -> bool {
        let Some(slot) = self.slot(account_id) else {
            return false;
        };
        let mut guard = slot.lock().await;
        if guard.available() < amount {
            return false;
        }
        guard.reserved += amount;
        true
    }

    /// Give back a reservation that will not be committed
    pub async fn cancel(&self, account_id: &AccountId, amount: u64) {
        let Some(slot) = self.slot(account_id) else {
            tracing::error!("Ledger invariant violated: cancel on unknown account {}", account_id);
            return;
        };
        let mut guard = slot.lock().await;
        if guard.reserved < amount {
            tracing::error!(
                "Ledger invariant violated: cancelling {} bytes on account {} with only {} reserved",
                amount,
                account_id,
                guard.reserved
            );
        }
        guard.reserved = guard.reserved.saturating_sub(amount);
    }

    /// Cancel the reservations of several planned chunks
    pub async fn cancel_chunks(&self, chunks: &[PlannedChunk]) {
        for chunk in chunks {
            self.cancel(&chunk.account_id, chunk.size).await;
        }
    }

    /// Reserve capacity for every chunk of a plan, or for none of them.
    ///
    /// The plan was computed from a snapshot; a concurrent upload may have
    /// taken the space since, in which case this fails with
    /// [`StorageError::NoCapacity`] for the first chunk that no longer fits.
    pub async fn reserve_plan(&self, plan: &ChunkPlan) -> Result<(), StorageError> {
        for (i, chunk) in plan.chunks.iter().enumerate() {
            if !self.try_reserve(&chunk.account_id, chunk.size).await {
                self.cancel_chunks(&plan.chunks[..i]).await;
                return Err(StorageError::NoCapacity {
                    order: chunk.order,
                    size: chunk.size,
                });
            }
        }
        Ok(())
    }

    /// Turn a reservation into a committed decrement.
    ///
    /// `persist` receives the account's new free capacity and must record it
    /// together with whatever the commit stands for. If it fails, the
    /// reservation is dropped and the capacity is left unchanged.
    pub async fn commit<F, Fut>(
        &self,
        account_id: &AccountId,
        amount: u64,
        persist: F,
    ) -> Result<u64, StorageError>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = Result<(), StorageError>>,
    {
        let slot = self
            .slot(account_id)
            .ok_or(StorageError::AccountNotFound(*account_id))?;
        let mut guard = slot.lock().await;

        if guard.reserved < amount {
            tracing::error!(
                "Ledger invariant violated: committing {} bytes on account {} with only {} reserved",
                amount,
                account_id,
                guard.reserved
            );
        }
        let committed = guard.committed.saturating_sub(amount);

        let result = persist(committed).await;
        guard.reserved = guard.reserved.saturating_sub(amount);
        result?;

        guard.committed = committed;
        Ok(committed)
    }

    /// Credit `amount` freed bytes back to an account.
    ///
    /// The credit itself cannot fail: one that would push the account past
    /// its quota is clamped to the quota and logged. The returned error is
    /// either `persist`'s own, in which case nothing is credited, or
    /// [`StorageError::AccountNotFound`] for an account the ledger does not
    /// track.
    pub async fn release<F, Fut>(
        &self,
        account_id: &AccountId,
        amount: u64,
        persist: F,
    ) -> Result<u64, StorageError>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = Result<(), StorageError>>,
    {
        let slot = self
            .slot(account_id)
            .ok_or(StorageError::AccountNotFound(*account_id))?;
        let mut guard = slot.lock().await;

        let mut committed = guard.committed.saturating_add(amount);
        if committed > guard.total {
            tracing::error!(
                "Ledger invariant violated: releasing {} bytes on account {} would exceed its {} byte quota",
                amount,
                account_id,
                guard.total
            );
            committed = guard.total;
        }

        persist(committed).await?;
        guard.committed = committed;
        Ok(committed)
    }
}
