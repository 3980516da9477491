//! Fixed-term investments and time-based profit accrual.
//!
//! Profit is never stored. It is recomputed from elapsed time on every read:
//!
//! `profit = principal * (monthly_rate / 100) * (elapsed_days / 30)`
//!
//! with `elapsed_days` clamped to the plan duration, so the value after maturity
//! is exactly the full-term profit.

use crate::domain::{AccountId, Decimal, EntryId, PlanId, TimeMs, DAY_MS};
use serde::{Deserialize, Serialize};

/// Days per accrual month.
const DAYS_PER_MONTH: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvestmentStatus {
    Pending,
    Active,
    Matured,
    Closed,
}

impl InvestmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvestmentStatus::Pending => "pending",
            InvestmentStatus::Active => "active",
            InvestmentStatus::Matured => "matured",
            InvestmentStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(InvestmentStatus::Pending),
            "active" => Some(InvestmentStatus::Active),
            "matured" => Some(InvestmentStatus::Matured),
            "closed" => Some(InvestmentStatus::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixedTermInvestment {
    pub id: i64,
    pub account_id: AccountId,
    pub plan_id: PlanId,
    /// The plan-purchase entry that funded this investment.
    pub funding_entry_id: EntryId,
    pub principal: Decimal,
    pub monthly_rate_pct: Decimal,
    pub duration_days: u32,
    /// Set on activation.
    pub start_at: Option<TimeMs>,
    /// Stored status; `Active` may already be matured, see [`Self::status_at`].
    pub status: InvestmentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payout_entry_id: Option<EntryId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<TimeMs>,
}

impl FixedTermInvestment {
    pub fn maturity_at(&self) -> Option<TimeMs> {
        self.start_at.map(|start| start.plus_days(self.duration_days))
    }

    /// Status as of `now`, evaluating the time-based `active -> matured` transition.
    pub fn status_at(&self, now: TimeMs) -> InvestmentStatus {
        match (self.status, self.maturity_at()) {
            (InvestmentStatus::Active, Some(maturity)) if now >= maturity => {
                InvestmentStatus::Matured
            }
            (status, _) => status,
        }
    }

    /// Elapsed accrual days at `now`, fractional, clamped to `[0, duration]`.
    pub fn elapsed_days(&self, now: TimeMs) -> Decimal {
        let Some(start) = self.start_at else {
            return Decimal::zero();
        };
        let elapsed_ms = (now.as_ms() - start.as_ms()).max(0);
        let max_ms = i64::from(self.duration_days) * DAY_MS;
        let clamped = elapsed_ms.min(max_ms);
        Decimal::from_i64(clamped) / Decimal::from_i64(DAY_MS)
    }

    /// Accrued profit at `now`, unrounded.
    pub fn profit_at(&self, now: TimeMs) -> Decimal {
        if self.status == InvestmentStatus::Pending {
            return Decimal::zero();
        }
        accrued_profit(self.principal, self.monthly_rate_pct, self.elapsed_days(now))
    }

    /// Profit over the whole term.
    pub fn full_term_profit(&self) -> Decimal {
        accrued_profit(
            self.principal,
            self.monthly_rate_pct,
            Decimal::from_i64(i64::from(self.duration_days)),
        )
    }
}

/// `principal * (monthly_rate_pct / 100) * (elapsed_days / 30)`.
pub fn accrued_profit(principal: Decimal, monthly_rate_pct: Decimal, elapsed_days: Decimal) -> Decimal {
    principal.percent(monthly_rate_pct) * elapsed_days / Decimal::from_i64(DAYS_PER_MONTH)
}
