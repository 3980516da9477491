//! Forced-matrix board positions.

use crate::domain::{AccountId, Decimal, EntryId, PlanId, TimeMs};
use serde::{Deserialize, Serialize};

/// `Filling` until the referral threshold is reached, `Completed` until the
/// payout/re-entry settlement is applied, then `ReEntered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatrixStatus {
    Filling,
    Completed,
    ReEntered,
}

impl MatrixStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatrixStatus::Filling => "filling",
            MatrixStatus::Completed => "completed",
            MatrixStatus::ReEntered => "re_entered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "filling" => Some(MatrixStatus::Filling),
            "completed" => Some(MatrixStatus::Completed),
            "re_entered" => Some(MatrixStatus::ReEntered),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixPosition {
    pub id: i64,
    pub account_id: AccountId,
    pub board_id: PlanId,
    pub cycle: u32,
    /// Qualifying direct placements counted in this cycle.
    pub qualified_count: u32,
    pub status: MatrixStatus,
    /// The entry that funded this cycle: the join purchase for cycle 1, the
    /// previous cycle's re-entry debit afterwards.
    pub source_entry_id: EntryId,
    pub created_at: TimeMs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<TimeMs>,
}

impl MatrixPosition {
    /// Fraction of the threshold reached, in percent, capped at 100.
    pub fn progress_pct(&self, required: u32) -> Decimal {
        if required == 0 {
            return Decimal::hundred();
        }
        let count = self.qualified_count.min(required);
        Decimal::from_i64(i64::from(count)) * Decimal::hundred()
            / Decimal::from_i64(i64::from(required))
    }

    pub fn is_open(&self) -> bool {
        self.status != MatrixStatus::ReEntered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(count: u32) -> MatrixPosition {
        MatrixPosition {
            id: 1,
            account_id: AccountId::new("a"),
            board_id: PlanId::new("board-1"),
            cycle: 1,
            qualified_count: count,
            status: MatrixStatus::Filling,
            source_entry_id: EntryId::new("e"),
            created_at: TimeMs::new(0),
            completed_at: None,
        }
    }

    #[test]
    fn test_progress_pct() {
        assert!(position(0).progress_pct(15).is_zero());
        assert_eq!(position(3).progress_pct(15), Decimal::from_i64(20));
        assert_eq!(position(20).progress_pct(15), Decimal::hundred());
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            MatrixStatus::Filling,
            MatrixStatus::Completed,
            MatrixStatus::ReEntered,
        ] {
            assert_eq!(MatrixStatus::parse(status.as_str()), Some(status));
        }
    }
}
