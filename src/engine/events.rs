//! Engine notifications for downstream consumers.
//!
//! Events are fire-and-forget: publishing never fails the operation that
//! produced it, and a bus with no subscribers simply drops them.

use crate::domain::{AccountId, Decimal, EntryId, PlanId};
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EngineEvent {
    DepositCredited {
        account: AccountId,
        entry_id: EntryId,
        amount: Decimal,
    },
    CommissionEarned {
        account: AccountId,
        entry_id: EntryId,
        source_entry_id: EntryId,
        level: u32,
        amount: Decimal,
    },
    WithdrawalRequested {
        account: AccountId,
        entry_id: EntryId,
        amount: Decimal,
    },
    WithdrawalResolved {
        account: AccountId,
        entry_id: EntryId,
        approved: bool,
    },
    InvestmentActivated {
        account: AccountId,
        investment_id: i64,
        principal: Decimal,
    },
    InvestmentMatured {
        account: AccountId,
        investment_id: i64,
    },
    InvestmentClosed {
        account: AccountId,
        investment_id: i64,
        payout: Decimal,
    },
    BoardJoined {
        account: AccountId,
        board: PlanId,
        cycle: u32,
    },
    BoardCompleted {
        account: AccountId,
        board: PlanId,
        cycle: u32,
        payout: Decimal,
        re_entry: Decimal,
    },
    ReconciliationFailed {
        account: AccountId,
        cached: Decimal,
        ledger: Decimal,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        if let Err(broadcast::error::SendError(event)) = self.tx.send(event) {
            tracing::debug!(?event, "no event subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
