//! Ledger entry types.

use crate::domain::{AccountId, Currency, Decimal, EntryId, PlanId, TimeMs};
use serde::{Deserialize, Serialize};

/// What caused a balance change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Deposit,
    Withdrawal,
    PlanPurchase,
    Commission,
    MatrixPayout,
    MatrixReentryDebit,
    AdminAdjustment,
    InvestmentPayout,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Deposit => "deposit",
            EntryKind::Withdrawal => "withdrawal",
            EntryKind::PlanPurchase => "plan_purchase",
            EntryKind::Commission => "commission",
            EntryKind::MatrixPayout => "matrix_payout",
            EntryKind::MatrixReentryDebit => "matrix_reentry_debit",
            EntryKind::AdminAdjustment => "admin_adjustment",
            EntryKind::InvestmentPayout => "investment_payout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "deposit" => EntryKind::Deposit,
            "withdrawal" => EntryKind::Withdrawal,
            "plan_purchase" => EntryKind::PlanPurchase,
            "commission" => EntryKind::Commission,
            "matrix_payout" => EntryKind::MatrixPayout,
            "matrix_reentry_debit" => EntryKind::MatrixReentryDebit,
            "admin_adjustment" => EntryKind::AdminAdjustment,
            "investment_payout" => EntryKind::InvestmentPayout,
            _ => return None,
        })
    }

    /// Completed entries of these kinds trigger downstream processing
    /// (commissions, plan activation).
    pub fn is_qualifying_source(&self) -> bool {
        matches!(self, EntryKind::Deposit | EntryKind::PlanPurchase)
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a ledger entry. `Completed` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Completed,
    Rejected,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Completed => "completed",
            EntryStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EntryStatus::Pending),
            "completed" => Some(EntryStatus::Completed),
            "rejected" => Some(EntryStatus::Rejected),
            _ => None,
        }
    }
}

/// An immutable journal line. Only the Wallet Façade creates these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    /// Arrival order across the whole journal.
    pub seq: i64,
    pub id: EntryId,
    pub account_id: AccountId,
    /// Signed: credits positive, debits negative.
    pub amount: Decimal,
    pub currency: Currency,
    pub kind: EntryKind,
    pub status: EntryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_entry_id: Option<EntryId>,
    /// Commission level (1..=5) or matrix cycle; 0 when not applicable.
    pub level: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<PlanId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    pub created_at: TimeMs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<TimeMs>,
}

impl LedgerEntry {
    /// Whether this entry counts toward the reconciled balance.
    pub fn is_settled(&self) -> bool {
        self.status == EntryStatus::Completed
    }
}

/// Request to append a ledger entry. Amount sign is carried by the draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDraft {
    pub account_id: AccountId,
    pub amount: Decimal,
    pub kind: EntryKind,
    pub status: EntryStatus,
    pub source_entry_id: Option<EntryId>,
    pub level: u32,
    pub idempotency_key: Option<String>,
    pub plan_id: Option<PlanId>,
    pub memo: Option<String>,
}

impl EntryDraft {
    /// A completed credit (positive amount).
    pub fn credit(account_id: AccountId, amount: Decimal, kind: EntryKind) -> Self {
        Self::completed(account_id, amount.abs(), kind)
    }

    /// A completed debit (stored as a negative amount).
    pub fn debit(account_id: AccountId, amount: Decimal, kind: EntryKind) -> Self {
        Self::completed(account_id, -amount.abs(), kind)
    }

    fn completed(account_id: AccountId, amount: Decimal, kind: EntryKind) -> Self {
        Self {
            account_id,
            amount,
            kind,
            status: EntryStatus::Completed,
            source_entry_id: None,
            level: 0,
            idempotency_key: None,
            plan_id: None,
            memo: None,
        }
    }

    pub fn pending(mut self) -> Self {
        self.status = EntryStatus::Pending;
        self
    }

    pub fn with_source(mut self, source: EntryId, level: u32) -> Self {
        self.source_entry_id = Some(source);
        self.level = level;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_plan(mut self, plan_id: PlanId) -> Self {
        self.plan_id = Some(plan_id);
        self
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }
}

/// Idempotency keys for effects that must be applied at most once.
pub mod keys {
    use crate::domain::{EntryId, PlanId};

    pub fn deposit(provider_reference: &str) -> String {
        format!("deposit:{}", provider_reference.trim())
    }

    pub fn commission(source: &EntryId, level: u32) -> String {
        format!("commission:{}:{}", source, level)
    }

    pub fn investment_payout(investment_id: i64) -> String {
        format!("investment:{}:payout", investment_id)
    }

    pub fn matrix_payout(board: &PlanId, account: &str, cycle: u32) -> String {
        format!("matrix:{}:{}:{}:payout", board, account, cycle)
    }

    pub fn matrix_reentry(board: &PlanId, account: &str, cycle: u32) -> String {
        format!("matrix:{}:{}:{}:reentry", board, account, cycle)
    }
}
