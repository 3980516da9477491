//! Levelled commission payout on qualifying source entries.

use super::events::{EngineEvent, EventBus};
use super::referral::ReferralGraph;
use super::wallet::WalletFacade;
use crate::config::InactiveAncestorPolicy;
use crate::db::Repository;
use crate::domain::{
    keys, AccountId, AccountStatus, CommissionSchedule, EntryDraft, EntryKind, EntryStatus,
    LedgerEntry, PlanCatalog,
};
use crate::error::{EngineError, EngineResult};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct CommissionDistributor {
    repo: Arc<Repository>,
    graph: Arc<ReferralGraph>,
    wallet: Arc<WalletFacade>,
    catalog: PlanCatalog,
    deposit_schedule: CommissionSchedule,
    policy: InactiveAncestorPolicy,
    events: EventBus,
}

impl CommissionDistributor {
    pub fn new(
        repo: Arc<Repository>,
        graph: Arc<ReferralGraph>,
        wallet: Arc<WalletFacade>,
        catalog: PlanCatalog,
        deposit_schedule: CommissionSchedule,
        policy: InactiveAncestorPolicy,
        events: EventBus,
    ) -> Self {
        Self {
            repo,
            graph,
            wallet,
            catalog,
            deposit_schedule,
            policy,
            events,
        }
    }

    /// Pay commissions for `source` to its ancestors.
    ///
    /// Returns the entries written by this call. Levels already paid and
    /// ancestors already holding a level for `source` are skipped, so a replay
    /// never pays one account twice for the same source. A failure on
    /// one level does not stop the others; the first error is returned after
    /// every level has been attempted.
    pub async fn distribute(&self, source: &LedgerEntry) -> EngineResult<Vec<LedgerEntry>> {
        if !source.kind.is_qualifying_source() || source.status != EntryStatus::Completed {
            return Err(EngineError::InvalidState(format!(
                "entry {} ({} {}) does not earn commission",
                source.id,
                source.kind,
                source.status.as_str()
            )));
        }

        let schedule = self.schedule_for(source)?;
        if schedule.is_empty() {
            return Ok(Vec::new());
        }

        let ancestors = self.graph.ancestors(&source.account_id).await?;
        let prior = self.paid_levels(source).await?;
        let base = source.amount.abs();
        let minor_units = self.wallet.minor_units();

        let mut paid = Vec::new();
        let mut first_error = None;
        for (level, ancestor) in self.level_slots(ancestors, &prior) {
            let Some(rate) = schedule.rate_for(level as usize) else {
                break;
            };
            let amount = base.percent(rate).round_half_up(minor_units);
            if !amount.is_positive() {
                continue;
            }

            let draft = EntryDraft::credit(ancestor.clone(), amount, EntryKind::Commission)
                .with_source(source.id.clone(), level)
                .with_idempotency_key(keys::commission(&source.id, level));
            match self.wallet.credit(draft).await {
                Ok(entry) => {
                    info!(
                        account = %ancestor,
                        source_entry_id = %source.id,
                        level,
                        amount = %amount,
                        "commission paid"
                    );
                    self.events.publish(EngineEvent::CommissionEarned {
                        account: ancestor,
                        entry_id: entry.id.clone(),
                        source_entry_id: source.id.clone(),
                        level,
                        amount,
                    });
                    paid.push(entry);
                }
                Err(EngineError::DuplicateEntry { entry_id }) => {
                    debug!(source_entry_id = %source.id, level, %entry_id, "commission already paid");
                }
                Err(err) => {
                    warn!(
                        account = %ancestor,
                        source_entry_id = %source.id,
                        level,
                        error = %err,
                        "commission credit failed"
                    );
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(paid),
        }
    }

    fn schedule_for(&self, source: &LedgerEntry) -> EngineResult<&CommissionSchedule> {
        match source.kind {
            EntryKind::Deposit => Ok(&self.deposit_schedule),
            _ => {
                let plan_id = source.plan_id.as_ref().ok_or_else(|| {
                    EngineError::InvalidState(format!("purchase {} has no plan", source.id))
                })?;
                self.catalog
                    .find(plan_id)
                    .map(|plan| plan.commission())
                    .ok_or_else(|| EngineError::NotFound(format!("plan {}", plan_id)))
            }
        }
    }

    /// Commission levels already completed for `source`, keyed by recipient.
    async fn paid_levels(&self, source: &LedgerEntry) -> EngineResult<HashMap<AccountId, u32>> {
        Ok(self
            .repo
            .entries_by_source(&source.id)
            .await?
            .into_iter()
            .filter(|e| e.kind == EntryKind::Commission && e.status == EntryStatus::Completed)
            .map(|e| (e.account_id, e.level))
            .collect())
    }

    /// Map visited ancestors to 1-indexed commission levels under the policy.
    ///
    /// Slots recorded in `prior` stay with their holder: those accounts and
    /// levels are excluded before the remaining slots are assigned.
    fn level_slots(
        &self,
        ancestors: Vec<(AccountId, AccountStatus)>,
        prior: &HashMap<AccountId, u32>,
    ) -> Vec<(u32, AccountId)> {
        let used: HashSet<u32> = prior.values().copied().collect();
        let eligible = |id: &AccountId, status: AccountStatus| {
            status == AccountStatus::Active && !prior.contains_key(id)
        };

        match self.policy {
            InactiveAncestorPolicy::Forfeit => ancestors
                .into_iter()
                .zip(1u32..)
                .filter(|((id, status), level)| eligible(id, *status) && !used.contains(level))
                .map(|((id, _), level)| (level, id))
                .collect(),
            InactiveAncestorPolicy::Compress => ancestors
                .into_iter()
                .filter(|(id, status)| eligible(id, *status))
                .zip((1u32..).filter(|level| !used.contains(level)))
                .map(|((id, _), level)| (level, id))
                .collect(),
        }
    }
}
