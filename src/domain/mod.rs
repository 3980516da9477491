//! Domain types for the referral compensation ledger.
//!
//! This module provides:
//! - Lossless money handling via the Decimal wrapper
//! - Identifiers and time primitives
//! - Accounts, ledger entries, plans, investments and matrix positions
//! - Pure accrual math for fixed-term investments

pub mod account;
pub mod decimal;
pub mod investment;
pub mod ledger;
pub mod matrix;
pub mod plan;
pub mod primitives;

pub use account::Account;
pub use decimal::Decimal;
pub use investment::{accrued_profit, FixedTermInvestment, InvestmentStatus};
pub use ledger::{keys, EntryDraft, EntryKind, EntryStatus, LedgerEntry};
pub use matrix::{MatrixPosition, MatrixStatus};
pub use plan::{
    CatalogError, CommissionSchedule, FixedTermPlan, MatrixBoard, Plan, PlanCatalog,
    MAX_COMMISSION_LEVELS,
};
pub use primitives::{
    AccountId, AccountStatus, Currency, EntryId, PlanId, ReferralCode, TimeMs, DAY_MS,
};
