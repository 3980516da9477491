//! The referral forest: parent pointers with an enforced acyclicity check.

use crate::db::Repository;
use crate::domain::{
    Account, AccountId, AccountStatus, Decimal, ReferralCode, TimeMs, MAX_COMMISSION_LEVELS,
};
use crate::error::{EngineError, EngineResult};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Attempts at deriving a free referral code before giving up.
const MAX_CODE_ATTEMPTS: u32 = 16;

pub struct ReferralGraph {
    repo: Arc<Repository>,
    require_active_referrer: bool,
    /// Serializes edge writes so two placements cannot race past the cycle check.
    placement_lock: Mutex<()>,
}

impl ReferralGraph {
    pub fn new(repo: Arc<Repository>, require_active_referrer: bool) -> Self {
        Self {
            repo,
            require_active_referrer,
            placement_lock: Mutex::new(()),
        }
    }

    /// Up to five ancestors of `account`, nearest first.
    pub async fn placements(&self, account: &AccountId) -> EngineResult<Vec<AccountId>> {
        Ok(self
            .ancestors(account)
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    /// Up to five ancestors with their current status, nearest first.
    pub async fn ancestors(
        &self,
        account: &AccountId,
    ) -> EngineResult<Vec<(AccountId, AccountStatus)>> {
        let (mut parent, _) = self
            .repo
            .placement_of(account)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("account {}", account)))?;

        let mut out = Vec::with_capacity(MAX_COMMISSION_LEVELS);
        let mut seen = HashSet::from([account.clone()]);
        while let Some(id) = parent {
            if out.len() == MAX_COMMISSION_LEVELS {
                break;
            }
            if !seen.insert(id.clone()) {
                return Err(EngineError::InvalidState(format!(
                    "placement cycle detected above {}",
                    account
                )));
            }
            let Some((next, status)) = self.repo.placement_of(&id).await? else {
                break;
            };
            out.push((id, status));
            parent = next;
        }
        Ok(out)
    }

    /// Whether `account` may be placed under `referrer`.
    pub async fn check_placement(
        &self,
        account: &AccountId,
        referrer: &AccountId,
    ) -> EngineResult<()> {
        if account == referrer {
            return Err(EngineError::InvalidPlacement(
                "an account cannot refer itself".into(),
            ));
        }

        let (mut parent, status) = self.repo.placement_of(referrer).await?.ok_or_else(|| {
            EngineError::InvalidPlacement(format!("referrer {} does not exist", referrer))
        })?;
        if self.require_active_referrer && status != AccountStatus::Active {
            return Err(EngineError::InvalidPlacement(format!(
                "referrer {} is not active",
                referrer
            )));
        }

        // Full walk, not capped at five: a cycle anywhere above is illegal.
        let mut seen = HashSet::from([referrer.clone()]);
        while let Some(id) = parent {
            if &id == account {
                return Err(EngineError::InvalidPlacement(format!(
                    "{} is an ancestor of {}",
                    account, referrer
                )));
            }
            if !seen.insert(id.clone()) {
                return Err(EngineError::InvalidState(format!(
                    "placement cycle detected above {}",
                    referrer
                )));
            }
            parent = match self.repo.placement_of(&id).await? {
                Some((next, _)) => next,
                None => None,
            };
        }
        Ok(())
    }

    /// Write the placement edge for an existing, unplaced account. Never re-parents.
    pub async fn place(&self, account: &AccountId, referrer: &AccountId) -> EngineResult<()> {
        let _lock = self.placement_lock.lock().await;

        let (current, _) = self
            .repo
            .placement_of(account)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("account {}", account)))?;
        if let Some(existing) = current {
            return Err(EngineError::InvalidPlacement(format!(
                "{} is already placed under {}",
                account, existing
            )));
        }

        self.check_placement(account, referrer).await?;
        if !self.repo.set_referrer_once(account, referrer).await? {
            return Err(EngineError::InvalidPlacement(format!(
                "{} is already placed",
                account
            )));
        }

        info!(account = %account, referrer = %referrer, "account placed");
        Ok(())
    }

    /// Create an account, optionally placed under `referrer`.
    pub async fn register(
        &self,
        account: &AccountId,
        referrer: Option<&AccountId>,
        now: TimeMs,
    ) -> EngineResult<Account> {
        let _lock = self.placement_lock.lock().await;

        if self.repo.get_account(account).await?.is_some() {
            return Err(EngineError::InvalidState(format!(
                "account {} already exists",
                account
            )));
        }
        if let Some(referrer) = referrer {
            self.check_placement(account, referrer).await?;
        }

        let referral_code = self.free_code(account).await?;
        let created = Account {
            id: account.clone(),
            referral_code,
            referrer_id: referrer.cloned(),
            status: AccountStatus::Active,
            wallet_balance: Decimal::zero(),
            ledger_frozen: false,
            created_at: now,
        };
        self.repo.insert_account(&created).await?;

        info!(
            account = %created.id,
            referrer = ?created.referrer_id.as_ref().map(|r| r.as_str()),
            code = %created.referral_code,
            "account registered"
        );
        Ok(created)
    }

    /// Resolve a referral code to the account that owns it.
    pub async fn resolve_code(&self, code: &str) -> EngineResult<AccountId> {
        let code = ReferralCode::new(code).normalized();
        self.repo
            .find_account_by_code(&code)
            .await?
            .map(|a| a.id)
            .ok_or_else(|| EngineError::InvalidPlacement(format!("unknown referral code {}", code)))
    }

    pub async fn referrals_of(&self, account: &AccountId) -> EngineResult<Vec<Account>> {
        Ok(self.repo.direct_referrals(account).await?)
    }

    async fn free_code(&self, account: &AccountId) -> EngineResult<ReferralCode> {
        for attempt in 0..MAX_CODE_ATTEMPTS {
            let code = ReferralCode::derive(account, attempt);
            if !self.repo.referral_code_exists(&code).await? {
                return Ok(code);
            }
        }
        Err(EngineError::InvalidState(format!(
            "could not allocate a referral code for {}",
            account
        )))
    }
}
