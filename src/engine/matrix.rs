//! Forced-matrix boards: `filling -> completed -> re_entered`, then a fresh
//! `filling` position at the next cycle.

use super::clock::Clock;
use super::events::{EngineEvent, EventBus};
use super::wallet::{AccountGuard, WalletFacade};
use crate::config::ReentryFunding;
use crate::db::{QualificationOutcome, Repository};
use crate::domain::{
    keys, AccountId, EntryDraft, EntryId, EntryKind, LedgerEntry, MatrixBoard, MatrixPosition,
    MatrixStatus, PlanCatalog,
};
use crate::error::{EngineError, EngineResult};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct MatrixEngine {
    repo: Arc<Repository>,
    wallet: Arc<WalletFacade>,
    catalog: PlanCatalog,
    clock: Arc<dyn Clock>,
    events: EventBus,
    funding: ReentryFunding,
}

impl MatrixEngine {
    pub fn new(
        repo: Arc<Repository>,
        wallet: Arc<WalletFacade>,
        catalog: PlanCatalog,
        clock: Arc<dyn Clock>,
        events: EventBus,
        funding: ReentryFunding,
    ) -> Self {
        Self {
            repo,
            wallet,
            catalog,
            clock,
            events,
            funding,
        }
    }

    /// Fail if `account` already holds an unsettled position on `board`.
    pub async fn ensure_can_join(
        &self,
        account: &AccountId,
        board: &MatrixBoard,
    ) -> EngineResult<()> {
        match self.repo.latest_position(account, &board.id).await? {
            Some(position) if position.is_open() => Err(EngineError::InvalidState(format!(
                "{} already holds cycle {} on {}",
                account, position.cycle, board.id
            ))),
            _ => Ok(()),
        }
    }

    /// Open the position paid for by `purchase`. Replaying returns the same position.
    pub async fn open_position(
        &self,
        purchase: &LedgerEntry,
        board: &MatrixBoard,
    ) -> EngineResult<MatrixPosition> {
        let account = &purchase.account_id;
        let history = self.repo.positions_of(account).await?;
        if let Some(existing) = history
            .iter()
            .find(|p| p.source_entry_id == purchase.id)
        {
            return Ok(existing.clone());
        }

        let latest = history.iter().rev().find(|p| p.board_id == board.id);
        let cycle = match latest {
            Some(p) if p.is_open() => {
                return Err(EngineError::InvalidState(format!(
                    "{} already holds cycle {} on {}",
                    account, p.cycle, board.id
                )))
            }
            Some(p) => p.cycle + 1,
            None => 1,
        };

        let position = self
            .repo
            .insert_position_if_absent(account, &board.id, cycle, &purchase.id, self.clock.now())
            .await?;
        info!(account = %account, board = %board.id, cycle, "board joined");
        self.events.publish(EngineEvent::BoardJoined {
            account: account.clone(),
            board: board.id.clone(),
            cycle,
        });
        Ok(position)
    }

    /// Open the purchaser's position and count the join toward the direct
    /// referrer's filling position, settling it if that reaches the threshold.
    /// A referrer position opened after the purchase does not count it.
    pub async fn join(
        &self,
        purchase: &LedgerEntry,
        board: &MatrixBoard,
    ) -> EngineResult<MatrixPosition> {
        let position = self.open_position(purchase, board).await?;

        let referrer = match self.repo.placement_of(&purchase.account_id).await? {
            Some((Some(referrer), _)) => referrer,
            _ => return Ok(position),
        };

        let guard = self.wallet.lock(&referrer).await;
        let outcome = self
            .repo
            .record_qualification(
                &board.id,
                &referrer,
                &purchase.account_id,
                board.required_referrals,
                purchase.created_at,
                self.clock.now(),
            )
            .await?;
        match outcome {
            QualificationOutcome::Counted(upline) => {
                debug!(
                    account = %referrer,
                    board = %board.id,
                    cycle = upline.cycle,
                    count = upline.qualified_count,
                    "referral qualified"
                );
                if upline.status == MatrixStatus::Completed {
                    self.settle_locked(&guard, &upline, board).await?;
                }
            }
            QualificationOutcome::NoOpenPosition => {
                self.report_uncounted(&referrer, purchase, board).await?;
            }
            QualificationOutcome::AlreadyCounted => {}
        }
        Ok(position)
    }

    /// A referrer who already held a position on `board` when `purchase` was
    /// made, but has no filling one now, lost this qualification to a rollover.
    async fn report_uncounted(
        &self,
        referrer: &AccountId,
        purchase: &LedgerEntry,
        board: &MatrixBoard,
    ) -> EngineResult<()> {
        let held_at_purchase = self
            .repo
            .positions_of(referrer)
            .await?
            .into_iter()
            .any(|p| p.board_id == board.id && p.created_at <= purchase.created_at);
        if held_at_purchase {
            warn!(
                account = %referrer,
                referee = %purchase.account_id,
                board = %board.id,
                source_entry_id = %purchase.id,
                "referral not counted: referrer position rolled over before the join was recorded"
            );
        } else {
            debug!(
                account = %referrer,
                referee = %purchase.account_id,
                board = %board.id,
                "referrer had no position on board at purchase time"
            );
        }
        Ok(())
    }

    /// Settle a `completed` position. No-op if it has already rolled over.
    pub async fn settle(&self, position_id: i64) -> EngineResult<Option<MatrixPosition>> {
        let position = self
            .repo
            .get_position(position_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("matrix position {}", position_id)))?;
        let board = self
            .catalog
            .board(&position.board_id)
            .ok_or_else(|| EngineError::NotFound(format!("board {}", position.board_id)))?;

        let guard = self.wallet.lock(&position.account_id).await;
        // Re-read under the lock: a concurrent settle may have finished first.
        let position = self
            .repo
            .get_position(position_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("matrix position {}", position_id)))?;
        if position.status != MatrixStatus::Completed {
            return Ok(None);
        }
        self.settle_locked(&guard, &position, board).await.map(Some)
    }

    /// Post payout and re-entry as one ledger batch, then roll the position
    /// over to the next cycle. Returns the new position.
    async fn settle_locked(
        &self,
        guard: &AccountGuard,
        position: &MatrixPosition,
        board: &MatrixBoard,
    ) -> EngineResult<MatrixPosition> {
        let account = guard.account();
        let source = position.source_entry_id.clone();

        let payout = EntryDraft::credit(account.clone(), board.total_income, EntryKind::MatrixPayout)
            .with_source(source.clone(), 0)
            .with_idempotency_key(keys::matrix_payout(&board.id, account.as_str(), position.cycle))
            .with_plan(board.id.clone());
        let mut drafts = vec![payout];
        if board.re_entry_amount.is_positive() {
            let re_entry = EntryDraft::debit(
                account.clone(),
                board.re_entry_amount,
                EntryKind::MatrixReentryDebit,
            )
            .with_source(source.clone(), 0)
            .with_idempotency_key(keys::matrix_reentry(&board.id, account.as_str(), position.cycle))
            .with_plan(board.id.clone());
            match self.funding {
                ReentryFunding::Payout => drafts.push(re_entry),
                ReentryFunding::Balance => drafts.insert(0, re_entry),
            }
        }

        let posted = match self.wallet.post_batch_locked(guard, &drafts).await {
            Ok(entries) => entries,
            Err(EngineError::DuplicateEntry { .. }) => {
                debug!(account = %account, cycle = position.cycle, "board settlement already posted");
                self.repo
                    .entries_by_source(&source)
                    .await?
                    .into_iter()
                    .filter(|e| {
                        matches!(e.kind, EntryKind::MatrixPayout | EntryKind::MatrixReentryDebit)
                    })
                    .collect()
            }
            Err(err) => return Err(err),
        };

        let next_source = next_cycle_source(&posted).ok_or_else(|| {
            EngineError::InvalidState(format!(
                "settlement entries missing for position {}",
                position.id
            ))
        })?;
        let next = self
            .repo
            .roll_over_position(position, &next_source, self.clock.now())
            .await?;

        info!(
            account = %account,
            board = %board.id,
            cycle = position.cycle,
            payout = %board.total_income,
            re_entry = %board.re_entry_amount,
            "board completed"
        );
        self.events.publish(EngineEvent::BoardCompleted {
            account: account.clone(),
            board: board.id.clone(),
            cycle: position.cycle,
            payout: board.total_income,
            re_entry: board.re_entry_amount,
        });
        Ok(next)
    }

    /// Positions left `completed` by an interrupted settlement.
    pub async fn unsettled(&self) -> EngineResult<Vec<MatrixPosition>> {
        Ok(self.repo.completed_positions().await?)
    }

    pub async fn positions_of(&self, account: &AccountId) -> EngineResult<Vec<MatrixPosition>> {
        Ok(self.repo.positions_of(account).await?)
    }
}

/// The re-entry debit funds the next cycle; boards without re-entry use the payout.
fn next_cycle_source(posted: &[LedgerEntry]) -> Option<EntryId> {
    posted
        .iter()
        .find(|e| e.kind == EntryKind::MatrixReentryDebit)
        .or_else(|| posted.iter().find(|e| e.kind == EntryKind::MatrixPayout))
        .map(|e| e.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::domain::{Decimal, PlanId, TimeMs};
    use crate::engine::clock::ManualClock;
    use crate::engine::referral::ReferralGraph;
    use tempfile::TempDir;

    struct Fixture {
        engine: MatrixEngine,
        graph: ReferralGraph,
        wallet: Arc<WalletFacade>,
        repo: Arc<Repository>,
        clock: Arc<ManualClock>,
        _temp: TempDir,
    }

    fn small_board() -> MatrixBoard {
        MatrixBoard {
            id: PlanId::new("mini"),
            name: "Mini".into(),
            price: Decimal::from_i64(25),
            required_referrals: 2,
            total_income: Decimal::from_i64(200),
            re_entry_amount: Decimal::from_i64(25),
            total_income_after_re_entry: Decimal::from_i64(175),
            commission: Default::default(),
        }
    }

    async fn fixture(funding: ReentryFunding) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir
            .path()
            .join("test.db")
            .to_string_lossy()
            .to_string();
        let repo = Arc::new(Repository::new(init_db(&db_path).await.unwrap()));
        let clock = Arc::new(ManualClock::new(TimeMs::new(0)));
        let events = EventBus::default();
        let wallet = Arc::new(WalletFacade::new(
            repo.clone(),
            crate::domain::Currency::new("USD"),
            2,
            clock.clone(),
            events.clone(),
        ));
        let catalog = PlanCatalog {
            fixed_term: vec![],
            matrix: vec![small_board()],
        };
        let engine = MatrixEngine::new(
            repo.clone(),
            wallet.clone(),
            catalog,
            clock.clone(),
            events,
            funding,
        );
        Fixture {
            engine,
            graph: ReferralGraph::new(repo.clone(), true),
            wallet,
            repo,
            clock,
            _temp: temp_dir,
        }
    }

    fn id(s: &str) -> AccountId {
        AccountId::new(s)
    }

    async fn purchase(f: &Fixture, account: &str) -> LedgerEntry {
        let board = small_board();
        f.wallet
            .credit(EntryDraft::credit(id(account), board.price, EntryKind::Deposit))
            .await
            .unwrap();
        f.wallet
            .debit(
                EntryDraft::debit(id(account), board.price, EntryKind::PlanPurchase)
                    .with_plan(board.id.clone()),
            )
            .await
            .unwrap()
    }

    async fn sponsor_with_downline(f: &Fixture) {
        f.graph.register(&id("s"), None, TimeMs::new(0)).await.unwrap();
        for d in ["d1", "d2", "d3"] {
            f.graph.register(&id(d), Some(&id("s")), TimeMs::new(0)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_completion_pays_net_and_rolls_over() {
        let f = fixture(ReentryFunding::Payout).await;
        sponsor_with_downline(&f).await;
        let board = small_board();

        let s_join = purchase(&f, "s").await;
        f.engine.join(&s_join, &board).await.unwrap();
        for d in ["d1", "d2"] {
            let entry = purchase(&f, d).await;
            f.engine.join(&entry, &board).await.unwrap();
        }

        let history = f.engine.positions_of(&id("s")).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, MatrixStatus::ReEntered);
        assert_eq!(history[0].qualified_count, 2);
        assert_eq!(history[1].cycle, 2);
        assert_eq!(history[1].status, MatrixStatus::Filling);
        assert_eq!(history[1].qualified_count, 0);

        // Net credit equals total income after re-entry.
        assert_eq!(f.wallet.balance_of(&id("s")).await.unwrap(), Decimal::from_i64(175));
        assert_eq!(f.wallet.reconcile(&id("s")).await.unwrap(), Decimal::from_i64(175));
    }

    #[tokio::test]
    async fn test_join_without_sponsor_position_counts_nothing() {
        let f = fixture(ReentryFunding::Payout).await;
        sponsor_with_downline(&f).await;
        let board = small_board();

        let entry = purchase(&f, "d1").await;
        f.engine.join(&entry, &board).await.unwrap();
        assert!(f.engine.positions_of(&id("s")).await.unwrap().is_empty());

        // A later sponsor join does not retroactively count d1.
        f.clock.advance_days(1);
        let s_join = purchase(&f, "s").await;
        f.engine.join(&s_join, &board).await.unwrap();
        let replay = f.engine.join(&entry, &board).await.unwrap();
        assert_eq!(replay.source_entry_id, entry.id);
        let s_pos = f.repo.latest_position(&id("s"), &board.id).await.unwrap().unwrap();
        assert_eq!(s_pos.qualified_count, 0);
    }

    #[tokio::test]
    async fn test_join_recorded_after_rollover_is_not_counted_in_next_cycle() {
        let f = fixture(ReentryFunding::Payout).await;
        sponsor_with_downline(&f).await;
        let board = small_board();

        let s_join = purchase(&f, "s").await;
        f.engine.join(&s_join, &board).await.unwrap();
        // Bought while cycle 1 was filling; the join is only recorded later.
        let late = purchase(&f, "d3").await;

        f.clock.advance_days(1);
        for d in ["d1", "d2"] {
            let entry = purchase(&f, d).await;
            f.engine.join(&entry, &board).await.unwrap();
        }
        let cycle_two = f.repo.latest_position(&id("s"), &board.id).await.unwrap().unwrap();
        assert_eq!(cycle_two.cycle, 2);

        let position = f.engine.join(&late, &board).await.unwrap();
        assert_eq!(position.account_id, id("d3"));
        let s_pos = f.repo.latest_position(&id("s"), &board.id).await.unwrap().unwrap();
        assert_eq!(s_pos.id, cycle_two.id);
        assert_eq!(s_pos.qualified_count, 0);
        assert_eq!(s_pos.status, MatrixStatus::Filling);
    }

    #[tokio::test]
    async fn test_open_position_blocks_second_join() {
        let f = fixture(ReentryFunding::Payout).await;
        sponsor_with_downline(&f).await;
        let board = small_board();

        let first = purchase(&f, "s").await;
        f.engine.join(&first, &board).await.unwrap();
        assert!(matches!(
            f.engine.ensure_can_join(&id("s"), &board).await,
            Err(EngineError::InvalidState(_))
        ));
        let second = purchase(&f, "s").await;
        assert!(matches!(
            f.engine.open_position(&second, &board).await,
            Err(EngineError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_balance_funding_needs_prior_balance() {
        let f = fixture(ReentryFunding::Balance).await;
        sponsor_with_downline(&f).await;
        let board = small_board();

        let s_join = purchase(&f, "s").await;
        f.engine.join(&s_join, &board).await.unwrap();
        let d1 = purchase(&f, "d1").await;
        f.engine.join(&d1, &board).await.unwrap();
        let d2 = purchase(&f, "d2").await;
        let err = f.engine.join(&d2, &board).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));

        // Threshold reached but unsettled; retried once the sponsor has funds.
        let pending = f.engine.unsettled().await.unwrap();
        assert_eq!(pending.len(), 1);
        f.wallet
            .credit(EntryDraft::credit(id("s"), Decimal::from_i64(25), EntryKind::Deposit))
            .await
            .unwrap();
        let next = f.engine.settle(pending[0].id).await.unwrap().unwrap();
        assert_eq!(next.cycle, 2);
        assert_eq!(f.wallet.balance_of(&id("s")).await.unwrap(), Decimal::from_i64(200));
        assert!(f.engine.settle(pending[0].id).await.unwrap().is_none());
    }
}
