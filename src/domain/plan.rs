//! Plan catalog: fixed-term plans, matrix boards and their commission schedules.
//!
//! The catalog is static configuration. It is loaded once at startup (from
//! `PLANS_FILE` or the built-in default) and validated before the engine starts.

use crate::domain::{Decimal, PlanId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Deepest ancestor level that can ever earn a commission.
pub const MAX_COMMISSION_LEVELS: usize = 5;

/// Ordered rate table indexed by ancestor distance 1..=5, in percent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommissionSchedule {
    pub rates_pct: Vec<Decimal>,
}

impl CommissionSchedule {
    pub fn new(rates_pct: Vec<Decimal>) -> Self {
        Self { rates_pct }
    }

    /// Rate for a 1-indexed level, if configured.
    pub fn rate_for(&self, level: usize) -> Option<Decimal> {
        if level == 0 {
            return None;
        }
        self.rates_pct.get(level - 1).copied()
    }

    pub fn levels(&self) -> usize {
        self.rates_pct.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates_pct.iter().all(|r| r.is_zero())
    }

    pub fn validate(&self, owner: &str) -> Result<(), CatalogError> {
        if self.rates_pct.len() > MAX_COMMISSION_LEVELS {
            return Err(CatalogError::Invalid(format!(
                "{}: at most {} commission levels allowed, got {}",
                owner,
                MAX_COMMISSION_LEVELS,
                self.rates_pct.len()
            )));
        }
        for rate in &self.rates_pct {
            if rate.is_negative() || *rate > Decimal::hundred() {
                return Err(CatalogError::Invalid(format!(
                    "{}: commission rate {} outside 0..=100",
                    owner, rate
                )));
            }
        }
        Ok(())
    }
}

/// A plan returning a monthly percentage over a fixed number of days.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixedTermPlan {
    pub id: PlanId,
    pub name: String,
    pub monthly_rate_pct: Decimal,
    pub duration_days: u32,
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    #[serde(default)]
    pub commission: CommissionSchedule,
}

/// A forced-matrix board that pays out once enough direct referrals have joined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixBoard {
    pub id: PlanId,
    pub name: String,
    /// Join price debited on purchase.
    pub price: Decimal,
    pub required_referrals: u32,
    pub total_income: Decimal,
    pub re_entry_amount: Decimal,
    pub total_income_after_re_entry: Decimal,
    #[serde(default)]
    pub commission: CommissionSchedule,
}

/// A catalog entry resolved by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan<'a> {
    FixedTerm(&'a FixedTermPlan),
    Matrix(&'a MatrixBoard),
}

impl<'a> Plan<'a> {
    pub fn commission(&self) -> &'a CommissionSchedule {
        match self {
            Plan::FixedTerm(p) => &p.commission,
            Plan::Matrix(b) => &b.commission,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanCatalog {
    #[serde(default)]
    pub fixed_term: Vec<FixedTermPlan>,
    #[serde(default)]
    pub matrix: Vec<MatrixBoard>,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Invalid plan catalog: {0}")]
    Invalid(String),
    #[error("Failed to read plan catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse plan catalog: {0}")]
    Parse(#[from] serde_json::Error),
}

impl PlanCatalog {
    /// Parse and validate a catalog from JSON.
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let catalog: PlanCatalog = serde_json::from_str(json)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_file(path: &str) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn find(&self, id: &PlanId) -> Option<Plan<'_>> {
        if let Some(plan) = self.fixed_term.iter().find(|p| &p.id == id) {
            return Some(Plan::FixedTerm(plan));
        }
        self.matrix.iter().find(|b| &b.id == id).map(Plan::Matrix)
    }

    pub fn board(&self, id: &PlanId) -> Option<&MatrixBoard> {
        self.matrix.iter().find(|b| &b.id == id)
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        let mut seen = std::collections::HashSet::new();
        let ids = self
            .fixed_term
            .iter()
            .map(|p| &p.id)
            .chain(self.matrix.iter().map(|b| &b.id));
        for id in ids {
            if !seen.insert(id) {
                return Err(CatalogError::Invalid(format!("duplicate plan id {}", id)));
            }
        }

        for plan in &self.fixed_term {
            plan.commission.validate(plan.id.as_str())?;
            if plan.duration_days == 0 {
                return Err(CatalogError::Invalid(format!(
                    "{}: duration must be positive",
                    plan.id
                )));
            }
            if plan.monthly_rate_pct.is_negative() {
                return Err(CatalogError::Invalid(format!(
                    "{}: monthly rate must not be negative",
                    plan.id
                )));
            }
            if !plan.min_amount.is_positive() || plan.max_amount < plan.min_amount {
                return Err(CatalogError::Invalid(format!(
                    "{}: amount bounds must satisfy 0 < min <= max",
                    plan.id
                )));
            }
        }

        for board in &self.matrix {
            board.commission.validate(board.id.as_str())?;
            if !board.price.is_positive() || board.required_referrals == 0 {
                return Err(CatalogError::Invalid(format!(
                    "{}: price and required referrals must be positive",
                    board.id
                )));
            }
            if !board.total_income.is_positive() {
                return Err(CatalogError::Invalid(format!(
                    "{}: total income must be positive",
                    board.id
                )));
            }
            if board.re_entry_amount.is_negative() || board.re_entry_amount > board.total_income {
                return Err(CatalogError::Invalid(format!(
                    "{}: re-entry amount must be within 0..=total income",
                    board.id
                )));
            }
            if board.total_income - board.re_entry_amount != board.total_income_after_re_entry {
                return Err(CatalogError::Invalid(format!(
                    "{}: total income after re-entry must equal {} - {}",
                    board.id, board.total_income, board.re_entry_amount
                )));
            }
        }
        Ok(())
    }

    /// Reject any configured amount with more fractional digits than the
    /// ledger currency carries.
    pub fn validate_scale(&self, minor_units: u32) -> Result<(), CatalogError> {
        let fixed = self.fixed_term.iter().flat_map(|p| {
            [("minAmount", p.min_amount), ("maxAmount", p.max_amount)]
                .into_iter()
                .map(move |(field, amount)| (&p.id, field, amount))
        });
        let boards = self.matrix.iter().flat_map(|b| {
            [
                ("price", b.price),
                ("totalIncome", b.total_income),
                ("reEntryAmount", b.re_entry_amount),
                ("totalIncomeAfterReEntry", b.total_income_after_re_entry),
            ]
            .into_iter()
            .map(move |(field, amount)| (&b.id, field, amount))
        });

        for (id, field, amount) in fixed.chain(boards) {
            if !amount.fits_scale(minor_units) {
                return Err(CatalogError::Invalid(format!(
                    "{}: {} {} has more than {} decimal places",
                    id, field, amount, minor_units
                )));
            }
        }
        Ok(())
    }
}

impl PlanCatalog {
    /// Built-in catalog used when no `PLANS_FILE` is configured.
    pub fn builtin() -> Self {
        let d = |v: i64| Decimal::from_i64(v);
        PlanCatalog {
            fixed_term: vec![
                FixedTermPlan {
                    id: PlanId::new("silver"),
                    name: "Silver".to_string(),
                    monthly_rate_pct: d(5),
                    duration_days: 90,
                    min_amount: d(50),
                    max_amount: d(5_000),
                    commission: CommissionSchedule::new(vec![d(5), d(3), d(1)]),
                },
                FixedTermPlan {
                    id: PlanId::new("gold"),
                    name: "Gold".to_string(),
                    monthly_rate_pct: d(8),
                    duration_days: 180,
                    min_amount: d(1_000),
                    max_amount: d(50_000),
                    commission: CommissionSchedule::new(vec![d(5), d(3), d(1)]),
                },
            ],
            matrix: vec![MatrixBoard {
                id: PlanId::new("board-1"),
                name: "Starter Board".to_string(),
                price: d(25),
                required_referrals: 15,
                total_income: d(200),
                re_entry_amount: d(25),
                total_income_after_re_entry: d(175),
                commission: CommissionSchedule::default(),
            }],
        }
    }
}
