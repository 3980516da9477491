//! Member account.

use crate::domain::{AccountId, AccountStatus, Decimal, ReferralCode, TimeMs};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: AccountId,
    pub referral_code: ReferralCode,
    /// The placing account. `None` for roots of the referral forest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer_id: Option<AccountId>,
    pub status: AccountStatus,
    /// Cached projection of the ledger; never the system of record.
    pub wallet_balance: Decimal,
    /// Set when reconciliation failed; all writes are refused until cleared by an operator.
    pub ledger_frozen: bool,
    pub created_at: TimeMs,
}

impl Account {
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}
