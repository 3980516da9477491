//! Fixed-term investment lifecycle: `pending -> active -> matured -> closed`.
//!
//! Maturity is evaluated lazily from elapsed time; the persisted status only
//! records transitions that have been acted upon.

use super::clock::Clock;
use super::events::{EngineEvent, EventBus};
use super::wallet::WalletFacade;
use crate::db::Repository;
use crate::domain::{
    keys, AccountId, Decimal, EntryDraft, EntryKind, EntryStatus, FixedTermInvestment,
    FixedTermPlan, InvestmentStatus, LedgerEntry, TimeMs,
};
use crate::error::{EngineError, EngineResult};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// An investment with its status and profit evaluated at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestmentView {
    #[serde(flatten)]
    pub investment: FixedTermInvestment,
    pub live_status: InvestmentStatus,
    pub accrued_profit: Decimal,
    pub full_term_profit: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maturity_at: Option<TimeMs>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvestmentSweep {
    pub matured: usize,
    pub closed: usize,
}

pub struct InvestmentEngine {
    repo: Arc<Repository>,
    wallet: Arc<WalletFacade>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    auto_close: bool,
}

impl InvestmentEngine {
    pub fn new(
        repo: Arc<Repository>,
        wallet: Arc<WalletFacade>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        auto_close: bool,
    ) -> Self {
        Self {
            repo,
            wallet,
            clock,
            events,
            auto_close,
        }
    }

    /// Create the investment funded by `funding` and activate it once the
    /// funding entry is completed. Safe to replay.
    pub async fn on_purchase(
        &self,
        funding: &LedgerEntry,
        plan: &FixedTermPlan,
    ) -> EngineResult<FixedTermInvestment> {
        let investment = self
            .repo
            .insert_investment_if_absent(
                &funding.account_id,
                &plan.id,
                &funding.id,
                funding.amount.abs(),
                plan.monthly_rate_pct,
                plan.duration_days,
            )
            .await?;

        if investment.status != InvestmentStatus::Pending
            || funding.status != EntryStatus::Completed
        {
            return Ok(investment);
        }

        if self
            .repo
            .activate_investment(investment.id, funding.created_at)
            .await?
        {
            info!(
                account = %investment.account_id,
                investment_id = investment.id,
                plan = %investment.plan_id,
                principal = %investment.principal,
                "investment activated"
            );
            self.events.publish(EngineEvent::InvestmentActivated {
                account: investment.account_id.clone(),
                investment_id: investment.id,
                principal: investment.principal,
            });
        }
        self.load(investment.id).await
    }

    pub fn view(&self, investment: FixedTermInvestment, now: TimeMs) -> InvestmentView {
        let minor_units = self.wallet.minor_units();
        InvestmentView {
            live_status: investment.status_at(now),
            accrued_profit: investment.profit_at(now).round_half_up(minor_units),
            full_term_profit: investment.full_term_profit().round_half_up(minor_units),
            maturity_at: investment.maturity_at(),
            investment,
        }
    }

    pub async fn investments_of(&self, account: &AccountId) -> EngineResult<Vec<InvestmentView>> {
        let now = self.clock.now();
        Ok(self
            .repo
            .investments_of(account)
            .await?
            .into_iter()
            .map(|inv| self.view(inv, now))
            .collect())
    }

    /// Pay principal plus full-term profit and close the investment.
    pub async fn payout(&self, id: i64) -> EngineResult<(FixedTermInvestment, LedgerEntry)> {
        self.payout_at(id, self.clock.now()).await
    }

    async fn payout_at(
        &self,
        id: i64,
        now: TimeMs,
    ) -> EngineResult<(FixedTermInvestment, LedgerEntry)> {
        let investment = self.load(id).await?;
        match investment.status_at(now) {
            InvestmentStatus::Matured => {}
            InvestmentStatus::Closed => {
                return Err(EngineError::InvalidState(format!(
                    "investment {} is already closed",
                    id
                )))
            }
            InvestmentStatus::Pending => {
                return Err(EngineError::InvalidState(format!(
                    "investment {} is not funded yet",
                    id
                )))
            }
            InvestmentStatus::Active => {
                return Err(EngineError::InvalidState(format!(
                    "investment {} matures at {}",
                    id,
                    investment
                        .maturity_at()
                        .map(|t| t.as_ms().to_string())
                        .unwrap_or_default()
                )))
            }
        }

        let amount = (investment.principal + investment.full_term_profit())
            .round_half_up(self.wallet.minor_units());
        let draft = EntryDraft::credit(
            investment.account_id.clone(),
            amount,
            EntryKind::InvestmentPayout,
        )
        .with_source(investment.funding_entry_id.clone(), 0)
        .with_idempotency_key(keys::investment_payout(investment.id))
        .with_plan(investment.plan_id.clone());

        let entry = match self.wallet.credit(draft).await {
            Ok(entry) => entry,
            Err(EngineError::DuplicateEntry { entry_id }) => self
                .repo
                .get_entry(&entry_id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("entry {}", entry_id)))?,
            Err(err) => return Err(err),
        };

        if self.repo.close_investment(id, &entry.id, now).await? {
            info!(
                account = %investment.account_id,
                investment_id = id,
                payout = %entry.amount,
                "investment closed"
            );
            self.events.publish(EngineEvent::InvestmentClosed {
                account: investment.account_id.clone(),
                investment_id: id,
                payout: entry.amount,
            });
        }
        Ok((self.load(id).await?, entry))
    }

    /// Persist maturity for investments past their term, and pay them out when
    /// auto-close is enabled.
    pub async fn sweep(&self, now: TimeMs) -> EngineResult<InvestmentSweep> {
        let mut report = InvestmentSweep::default();

        for investment in self.repo.due_investments(now).await? {
            if self.repo.mark_investment_matured(investment.id).await? {
                report.matured += 1;
                info!(
                    account = %investment.account_id,
                    investment_id = investment.id,
                    "investment matured"
                );
                self.events.publish(EngineEvent::InvestmentMatured {
                    account: investment.account_id.clone(),
                    investment_id: investment.id,
                });
            }
        }

        if self.auto_close {
            for investment in self.repo.matured_investments().await? {
                match self.payout_at(investment.id, now).await {
                    Ok(_) => report.closed += 1,
                    Err(err) => warn!(
                        investment_id = investment.id,
                        error = %err,
                        "auto payout failed"
                    ),
                }
            }
        }

        Ok(report)
    }

    async fn load(&self, id: i64) -> EngineResult<FixedTermInvestment> {
        self.repo
            .get_investment(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("investment {}", id)))
    }
}
