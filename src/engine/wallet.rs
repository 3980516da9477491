//! The only write path into the ledger.
//!
//! Every balance-affecting change for an account runs under that account's
//! lock and inside one `LedgerTx`: duplicate check, funds check, entry insert
//! and cached-balance update commit together or not at all.

use super::clock::Clock;
use super::events::{EngineEvent, EventBus};
use crate::db::Repository;
use crate::domain::{
    AccountId, Currency, Decimal, EntryDraft, EntryId, EntryKind, EntryStatus, LedgerEntry,
};
use crate::error::{EngineError, EngineResult};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info};

/// Proof that the caller holds an account's write lock.
pub struct AccountGuard {
    account: AccountId,
    _guard: OwnedMutexGuard<()>,
}

impl AccountGuard {
    pub fn account(&self) -> &AccountId {
        &self.account
    }
}

pub struct WalletFacade {
    repo: Arc<Repository>,
    currency: Currency,
    minor_units: u32,
    clock: Arc<dyn Clock>,
    events: EventBus,
    locks: DashMap<AccountId, Arc<Mutex<()>>>,
}

impl WalletFacade {
    pub fn new(
        repo: Arc<Repository>,
        currency: Currency,
        minor_units: u32,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            repo,
            currency,
            minor_units,
            clock,
            events,
            locks: DashMap::new(),
        }
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn minor_units(&self) -> u32 {
        self.minor_units
    }

    /// Acquire the write lock for `account`. Operations on one account are
    /// applied in the order their callers acquire this lock.
    pub async fn lock(&self, account: &AccountId) -> AccountGuard {
        let mutex = self
            .locks
            .entry(account.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        AccountGuard {
            account: account.clone(),
            _guard: mutex.lock_owned().await,
        }
    }

    /// Append a completed credit.
    ///
    /// # Errors
    /// `DuplicateEntry` if the same effect is already recorded.
    pub async fn credit(&self, draft: EntryDraft) -> EngineResult<LedgerEntry> {
        if !draft.amount.is_positive() {
            return Err(EngineError::Validation("credit amount must be positive".into()));
        }
        self.post(draft).await
    }

    /// Append a completed debit.
    ///
    /// # Errors
    /// `InsufficientFunds` if the amount exceeds the available balance.
    pub async fn debit(&self, draft: EntryDraft) -> EngineResult<LedgerEntry> {
        if !draft.amount.is_negative() {
            return Err(EngineError::Validation("debit amount must be negative".into()));
        }
        self.post(draft).await
    }

    /// Record a pending withdrawal. The amount is reserved until resolved.
    pub async fn request_withdrawal(
        &self,
        account: &AccountId,
        amount: Decimal,
        destination: &str,
    ) -> EngineResult<LedgerEntry> {
        let draft = EntryDraft::debit(account.clone(), amount, EntryKind::Withdrawal)
            .pending()
            .with_memo(destination);
        self.debit(draft).await
    }

    /// Move a pending withdrawal to `completed` or `rejected`.
    pub async fn resolve_withdrawal(
        &self,
        entry_id: &EntryId,
        approve: bool,
    ) -> EngineResult<LedgerEntry> {
        let entry = self
            .repo
            .get_entry(entry_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("entry {}", entry_id)))?;
        if entry.kind != EntryKind::Withdrawal {
            return Err(EngineError::InvalidState(format!(
                "entry {} is a {}, not a withdrawal",
                entry_id, entry.kind
            )));
        }

        let _guard = self.lock(&entry.account_id).await;
        let now = self.clock.now();
        let mut tx = self.repo.begin_ledger_tx().await?;

        let current = tx
            .get_entry(entry_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("entry {}", entry_id)))?;
        if current.status != EntryStatus::Pending {
            return Err(EngineError::InvalidState(format!(
                "withdrawal {} is already {}",
                entry_id,
                current.status.as_str()
            )));
        }

        let (balance, frozen) = tx
            .account_state(&current.account_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("account {}", current.account_id)))?;
        if frozen {
            return Err(EngineError::AccountFrozen(current.account_id.clone()));
        }

        let status = if approve {
            let after = balance + current.amount;
            if after.is_negative() {
                return Err(EngineError::InsufficientFunds {
                    account: current.account_id.clone(),
                    requested: current.amount.abs(),
                    available: balance,
                });
            }
            tx.set_cached_balance(&current.account_id, after).await?;
            EntryStatus::Completed
        } else {
            EntryStatus::Rejected
        };

        if !tx.resolve_pending(entry_id, status, now).await? {
            return Err(EngineError::InvalidState(format!(
                "withdrawal {} is no longer pending",
                entry_id
            )));
        }
        let resolved = tx
            .get_entry(entry_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("entry {}", entry_id)))?;
        tx.commit().await?;

        info!(
            account = %resolved.account_id,
            entry_id = %entry_id,
            status = resolved.status.as_str(),
            "withdrawal resolved"
        );
        Ok(resolved)
    }

    async fn post(&self, draft: EntryDraft) -> EngineResult<LedgerEntry> {
        let guard = self.lock(&draft.account_id).await;
        let mut entries = self.post_batch_locked(&guard, &[draft]).await?;
        entries
            .pop()
            .ok_or_else(|| EngineError::InvalidState("empty ledger batch".into()))
    }

    /// Post several entries for the guarded account in one transaction.
    ///
    /// Funds are checked against a running balance in draft order, so a debit
    /// placed after a credit in the same batch may spend that credit. If any
    /// draft is a duplicate the whole batch is abandoned with `DuplicateEntry`.
    pub async fn post_batch_locked(
        &self,
        guard: &AccountGuard,
        drafts: &[EntryDraft],
    ) -> EngineResult<Vec<LedgerEntry>> {
        let account = guard.account();
        for draft in drafts {
            if &draft.account_id != account {
                return Err(EngineError::InvalidState(format!(
                    "draft for {} posted under the lock of {}",
                    draft.account_id, account
                )));
            }
            if draft.amount.is_zero() {
                return Err(EngineError::Validation("amount must not be zero".into()));
            }
            if !draft.amount.fits_scale(self.minor_units) {
                return Err(EngineError::Validation(format!(
                    "amount {} has more than {} decimal places",
                    draft.amount, self.minor_units
                )));
            }
        }

        let now = self.clock.now();
        let mut tx = self.repo.begin_ledger_tx().await?;

        let (mut balance, frozen) = tx
            .account_state(account)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("account {}", account)))?;
        if frozen {
            return Err(EngineError::AccountFrozen(account.clone()));
        }
        let reserved = tx.pending_withdrawals(account).await?;

        let mut posted = Vec::with_capacity(drafts.len());
        for draft in drafts {
            if let Some(existing) = tx.find_duplicate(draft).await? {
                debug!(
                    account = %account,
                    entry_id = %existing.id,
                    kind = %draft.kind,
                    "duplicate ledger effect, skipping"
                );
                return Err(EngineError::DuplicateEntry {
                    entry_id: existing.id,
                });
            }

            if draft.amount.is_negative() {
                let available = balance + reserved;
                if (available + draft.amount).is_negative() {
                    return Err(EngineError::InsufficientFunds {
                        account: account.clone(),
                        requested: draft.amount.abs(),
                        available,
                    });
                }
            }

            let entry = tx.insert_entry(draft, &self.currency, now).await?;
            if entry.status == EntryStatus::Completed {
                balance = balance + entry.amount;
            }
            posted.push(entry);
        }

        tx.set_cached_balance(account, balance).await?;
        tx.commit().await?;

        for entry in &posted {
            info!(
                account = %account,
                entry_id = %entry.id,
                kind = %entry.kind,
                amount = %entry.amount,
                status = entry.status.as_str(),
                "ledger entry appended"
            );
        }
        Ok(posted)
    }

    /// The cached balance projection.
    pub async fn balance_of(&self, account: &AccountId) -> EngineResult<Decimal> {
        let account = self
            .repo
            .get_account(account)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("account {}", account)))?;
        Ok(account.wallet_balance)
    }

    /// Balance minus funds reserved by pending withdrawals.
    pub async fn available_balance(&self, account: &AccountId) -> EngineResult<Decimal> {
        let balance = self.balance_of(account).await?;
        let reserved = self.repo.pending_withdrawals(account).await?;
        Ok(balance + reserved)
    }

    /// Recompute the balance from completed entries and compare with the cache.
    ///
    /// A mismatch freezes the account's ledger until an operator intervenes.
    pub async fn reconcile(&self, account: &AccountId) -> EngineResult<Decimal> {
        let _guard = self.lock(account).await;
        let cached = self.balance_of(account).await?;
        let ledger = self.repo.sum_completed(account).await?;
        if cached == ledger {
            debug!(account = %account, balance = %cached, "reconciled");
            return Ok(cached);
        }

        error!(
            account = %account,
            cached = %cached,
            ledger = %ledger,
            "reconciliation mismatch, freezing ledger"
        );
        self.repo.set_ledger_frozen(account, true).await?;
        self.events.publish(EngineEvent::ReconciliationFailed {
            account: account.clone(),
            cached,
            ledger,
        });
        Err(EngineError::ReconciliationMismatch {
            account: account.clone(),
            cached,
            ledger,
        })
    }
}
