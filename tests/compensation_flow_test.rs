use std::str::FromStr;
use std::sync::Arc;
use tempfile::TempDir;
use wealthgrid::config::{Config, InactiveAncestorPolicy};
use wealthgrid::db::{init_db, DbPools};
use wealthgrid::domain::{
    AccountId, AccountStatus, Decimal, EntryDraft, EntryKind, EntryStatus, InvestmentStatus,
    LedgerEntry, MatrixStatus, PlanId, TimeMs,
};
use wealthgrid::engine::{EventBus, ManualClock, WalletFacade};
use wealthgrid::orchestration::{AdjustmentDirection, Orchestrator};
use wealthgrid::{Clock, EngineError, Repository};

const T0: i64 = 1_700_000_000_000;

struct Harness {
    orchestrator: Arc<Orchestrator>,
    repo: Arc<Repository>,
    pools: DbPools,
    clock: Arc<ManualClock>,
    _temp: TempDir,
}

async fn setup() -> Harness {
    setup_with(|_| {}).await
}

async fn setup_with(tweak: impl FnOnce(&mut Config)) -> Harness {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir
        .path()
        .join("test.db")
        .to_string_lossy()
        .to_string();
    let pools = init_db(&db_path).await.expect("init_db failed");
    let repo = Arc::new(Repository::new(pools.clone()));

    let mut config = Config::for_database(db_path);
    tweak(&mut config);
    let clock = Arc::new(ManualClock::new(TimeMs::new(T0)));
    let orchestrator = Arc::new(Orchestrator::new(repo.clone(), config, clock.clone()));

    Harness {
        orchestrator,
        repo,
        pools,
        clock,
        _temp: temp_dir,
    }
}

fn d(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn id(s: &str) -> AccountId {
    AccountId::new(s)
}

impl Harness {
    async fn register(&self, account: &str, referrer: Option<&str>) {
        let code = match referrer {
            Some(r) => Some(
                self.orchestrator
                    .account(&id(r))
                    .await
                    .unwrap()
                    .referral_code
                    .to_string(),
            ),
            None => None,
        };
        self.orchestrator
            .register_account(&id(account), code.as_deref())
            .await
            .unwrap();
    }

    /// Register a straight chain, root first.
    async fn chain(&self, names: &[&str]) {
        let mut parent: Option<&str> = None;
        for name in names {
            self.register(name, parent).await;
            parent = Some(name);
        }
    }

    async fn deposit(&self, account: &str, amount: &str, reference: &str) -> LedgerEntry {
        self.orchestrator
            .notify_deposit_confirmed(&id(account), d(amount), "USD", reference)
            .await
            .unwrap()
    }

    async fn fund(&self, account: &str, amount: &str) {
        self.orchestrator
            .admin_adjust_balance(
                &id(account),
                d(amount),
                AdjustmentDirection::Credit,
                "test funding",
                "ops",
            )
            .await
            .unwrap();
    }

    async fn balance(&self, account: &str) -> Decimal {
        self.orchestrator
            .balance_of(&id(account))
            .await
            .unwrap()
            .balance
    }

    async fn entries(&self, account: &str) -> Vec<LedgerEntry> {
        self.orchestrator
            .ledger_of(&id(account), None, Some(500))
            .await
            .unwrap()
            .entries
    }

    async fn commissions_from(&self, account: &str, source: &LedgerEntry) -> Vec<LedgerEntry> {
        self.entries(account)
            .await
            .into_iter()
            .filter(|e| e.kind == EntryKind::Commission)
            .filter(|e| e.source_entry_id.as_ref() == Some(&source.id))
            .collect()
    }
}

#[tokio::test]
async fn test_deposit_pays_commission_by_level_distance() {
    let h = setup().await;
    h.chain(&["root", "a", "b", "c"]).await;

    let source = h.deposit("c", "100", "psp-1").await;
    assert_eq!(source.kind, EntryKind::Deposit);
    assert_eq!(source.status, EntryStatus::Completed);

    assert_eq!(h.balance("c").await, d("100"));
    assert_eq!(h.balance("b").await, d("10"));
    assert_eq!(h.balance("a").await, d("5"));
    assert_eq!(h.balance("root").await, d("3"));

    let to_b = h.commissions_from("b", &source).await;
    assert_eq!(to_b.len(), 1);
    assert_eq!(to_b[0].level, 1);
    let to_root = h.commissions_from("root", &source).await;
    assert_eq!(to_root[0].level, 3);
}

#[tokio::test]
async fn test_deposit_redelivery_is_idempotent() {
    let h = setup().await;
    h.chain(&["a", "b"]).await;

    let first = h.deposit("b", "40", "psp-7").await;
    let second = h.deposit("b", "40", "psp-7").await;
    assert_eq!(first.id, second.id);

    assert_eq!(h.balance("b").await, d("40"));
    assert_eq!(h.balance("a").await, d("4"));
    assert_eq!(h.entries("a").await.len(), 1);

    let err = h
        .orchestrator
        .notify_deposit_confirmed(&id("b"), d("41"), "USD", "psp-7")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    let err = h
        .orchestrator
        .notify_deposit_confirmed(&id("b"), d("41"), "EUR", "psp-8")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn test_reprocessing_a_source_writes_nothing() {
    let h = setup().await;
    h.chain(&["a", "b", "c"]).await;
    let source = h.deposit("c", "100", "psp-1").await;

    for _ in 0..3 {
        h.orchestrator.process_source_entry(&source.id).await.unwrap();
    }
    let report = h.orchestrator.run_sweep(h.clock.now()).await.unwrap();
    assert_eq!(report.sources_processed, 0);

    assert_eq!(h.commissions_from("b", &source).await.len(), 1);
    assert_eq!(h.commissions_from("a", &source).await.len(), 1);
    assert_eq!(h.balance("b").await, d("10"));
}

#[tokio::test]
async fn test_commission_stops_after_five_levels() {
    let h = setup().await;
    h.chain(&["l6", "l5", "l4", "l3", "l2", "l1", "buyer"]).await;

    h.deposit("buyer", "100", "psp-1").await;

    assert_eq!(h.balance("l1").await, d("10"));
    assert_eq!(h.balance("l2").await, d("5"));
    assert_eq!(h.balance("l3").await, d("3"));
    assert_eq!(h.balance("l4").await, d("2"));
    assert_eq!(h.balance("l5").await, d("1"));
    assert_eq!(h.balance("l6").await, Decimal::zero());
}

#[tokio::test]
async fn test_inactive_ancestor_forfeits_level() {
    let h = setup().await;
    h.chain(&["root", "a", "b", "c"]).await;
    h.orchestrator
        .set_account_status(&id("a"), AccountStatus::Inactive)
        .await
        .unwrap();

    h.deposit("c", "100", "psp-1").await;

    assert_eq!(h.balance("b").await, d("10"));
    assert_eq!(h.balance("a").await, Decimal::zero());
    assert_eq!(h.balance("root").await, d("3"));
}

#[tokio::test]
async fn test_inactive_ancestor_compressed() {
    let h = setup_with(|c| c.inactive_ancestor_policy = InactiveAncestorPolicy::Compress).await;
    h.chain(&["root", "a", "b", "c"]).await;
    h.orchestrator
        .set_account_status(&id("a"), AccountStatus::Inactive)
        .await
        .unwrap();

    h.deposit("c", "100", "psp-1").await;

    assert_eq!(h.balance("b").await, d("10"));
    assert_eq!(h.balance("a").await, Decimal::zero());
    assert_eq!(h.balance("root").await, d("5"));
}

#[tokio::test]
async fn test_placement_rejects_cycles_and_reparenting() {
    let h = setup().await;
    h.register("a", None).await;
    h.register("b", Some("a")).await;
    h.register("x", None).await;

    // b already has a referrer.
    let x_code = h.orchestrator.account(&id("x")).await.unwrap().referral_code;
    let err = h
        .orchestrator
        .place_account(&id("b"), x_code.as_str())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidPlacement(_)));

    // a is a root, but b is below it.
    let b_code = h.orchestrator.account(&id("b")).await.unwrap().referral_code;
    let err = h
        .orchestrator
        .place_account(&id("a"), b_code.as_str())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidPlacement(_)));

    // Self-referral by code.
    let a_code = h.orchestrator.account(&id("a")).await.unwrap().referral_code;
    let err = h
        .orchestrator
        .place_account(&id("a"), a_code.as_str())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidPlacement(_)));

    // A legal placement of a root under another tree.
    let placed = h
        .orchestrator
        .place_account(&id("x"), &b_code.as_str().to_lowercase())
        .await
        .unwrap();
    assert_eq!(placed.referrer_id, Some(id("b")));
    assert_eq!(
        h.orchestrator.upline_of(&id("x")).await.unwrap(),
        vec![id("b"), id("a")]
    );
}

#[tokio::test]
async fn test_fixed_term_lifecycle() {
    let h = setup().await;
    h.chain(&["sponsor", "investor"]).await;
    h.fund("investor", "1000").await;

    let outcome = h
        .orchestrator
        .purchase_plan(&id("investor"), &PlanId::new("silver"), d("1000"))
        .await
        .unwrap();
    let investment = outcome.investment.expect("investment activated");
    assert_eq!(investment.status, InvestmentStatus::Active);
    assert_eq!(investment.start_at, Some(TimeMs::new(T0)));
    assert_eq!(h.balance("investor").await, Decimal::zero());
    // Silver level-1 commission on the purchase.
    assert_eq!(h.balance("sponsor").await, d("50"));

    h.clock.advance_days(30);
    let views = h.orchestrator.investments_of(&id("investor")).await.unwrap();
    assert_eq!(views[0].accrued_profit, d("50"));
    assert_eq!(views[0].live_status, InvestmentStatus::Active);

    let err = h
        .orchestrator
        .payout_investment(investment.id)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    h.clock.advance_days(70);
    let views = h.orchestrator.investments_of(&id("investor")).await.unwrap();
    assert_eq!(views[0].accrued_profit, d("150"));
    assert_eq!(views[0].live_status, InvestmentStatus::Matured);

    let report = h.orchestrator.run_sweep(h.clock.now()).await.unwrap();
    assert_eq!(report.investments_matured, 1);
    assert_eq!(report.investments_closed, 0);

    let (closed, entry) = h.orchestrator.payout_investment(investment.id).await.unwrap();
    assert_eq!(closed.status, InvestmentStatus::Closed);
    assert_eq!(entry.amount, d("1150"));
    assert_eq!(entry.kind, EntryKind::InvestmentPayout);
    assert_eq!(h.balance("investor").await, d("1150"));

    let err = h
        .orchestrator
        .payout_investment(investment.id)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));
    assert_eq!(h.balance("investor").await, d("1150"));
}

#[tokio::test]
async fn test_sweep_auto_closes_matured_investments() {
    let h = setup_with(|c| c.auto_close_matured = true).await;
    h.register("investor", None).await;
    h.fund("investor", "100").await;
    h.orchestrator
        .purchase_plan(&id("investor"), &PlanId::new("silver"), d("100"))
        .await
        .unwrap();

    h.clock.advance_days(91);
    let report = h.orchestrator.run_sweep(h.clock.now()).await.unwrap();
    assert_eq!(report.investments_matured, 1);
    assert_eq!(report.investments_closed, 1);
    assert_eq!(h.balance("investor").await, d("115"));
}

#[tokio::test]
async fn test_purchase_validates_plan_and_funds() {
    let h = setup().await;
    h.register("a", None).await;
    h.fund("a", "30").await;

    let err = h
        .orchestrator
        .purchase_plan(&id("a"), &PlanId::new("platinum"), d("10"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    let err = h
        .orchestrator
        .purchase_plan(&id("a"), &PlanId::new("silver"), d("10"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let err = h
        .orchestrator
        .purchase_plan(&id("a"), &PlanId::new("silver"), d("60"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientFunds { .. }));

    let err = h
        .orchestrator
        .purchase_plan(&id("a"), &PlanId::new("board-1"), d("30"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(h.balance("a").await, d("30"));
}

#[tokio::test]
async fn test_matrix_completion_pays_net_and_reenters() {
    let h = setup().await;
    h.register("sponsor", None).await;
    h.fund("sponsor", "25").await;
    let joined = h
        .orchestrator
        .purchase_plan(&id("sponsor"), &PlanId::new("board-1"), d("25"))
        .await
        .unwrap();
    let first = joined.position.expect("position opened");
    assert_eq!(first.cycle, 1);

    let err = h
        .orchestrator
        .purchase_plan(&id("sponsor"), &PlanId::new("board-1"), d("25"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    for i in 0..15 {
        let name = format!("member-{}", i);
        h.register(&name, Some("sponsor")).await;
        h.fund(&name, "25").await;
        h.orchestrator
            .purchase_plan(&id(&name), &PlanId::new("board-1"), d("25"))
            .await
            .unwrap();
    }

    assert_eq!(h.balance("sponsor").await, d("175"));

    let boards = h.orchestrator.matrix_position_of(&id("sponsor")).await.unwrap();
    assert_eq!(boards.len(), 1);
    let board = &boards[0];
    assert_eq!(board.history.len(), 2);
    assert_eq!(board.history[0].status, MatrixStatus::ReEntered);
    assert_eq!(board.history[0].qualified_count, 15);
    let current = board.current.as_ref().expect("open cycle");
    assert_eq!(current.cycle, 2);
    assert_eq!(current.qualified_count, 0);
    assert_eq!(board.progress_pct, Decimal::zero());

    let kinds: Vec<EntryKind> = h.entries("sponsor").await.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds.iter().filter(|k| **k == EntryKind::MatrixPayout).count(),
        1
    );
    assert_eq!(
        kinds
            .iter()
            .filter(|k| **k == EntryKind::MatrixReentryDebit)
            .count(),
        1
    );

    // Nothing left for the sweep to settle.
    let report = h.orchestrator.run_sweep(h.clock.now()).await.unwrap();
    assert_eq!(report.boards_settled, 0);
    assert_eq!(h.balance("sponsor").await, d("175"));
}

#[tokio::test]
async fn test_withdrawal_reserves_then_settles() {
    let h = setup().await;
    h.register("a", None).await;
    h.deposit("a", "100", "psp-1").await;

    let pending = h
        .orchestrator
        .request_withdrawal(&id("a"), d("60"), "iban:DE00")
        .await
        .unwrap();
    assert_eq!(pending.status, EntryStatus::Pending);
    let summary = h.orchestrator.balance_of(&id("a")).await.unwrap();
    assert_eq!(summary.balance, d("100"));
    assert_eq!(summary.available, d("40"));

    let err = h
        .orchestrator
        .request_withdrawal(&id("a"), d("50"), "iban:DE00")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientFunds { .. }));

    let approved = h
        .orchestrator
        .resolve_withdrawal(&pending.id, true)
        .await
        .unwrap();
    assert_eq!(approved.status, EntryStatus::Completed);
    assert_eq!(h.balance("a").await, d("40"));

    let err = h
        .orchestrator
        .resolve_withdrawal(&pending.id, false)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));

    let second = h
        .orchestrator
        .request_withdrawal(&id("a"), d("30"), "iban:DE00")
        .await
        .unwrap();
    let rejected = h
        .orchestrator
        .resolve_withdrawal(&second.id, false)
        .await
        .unwrap();
    assert_eq!(rejected.status, EntryStatus::Rejected);
    let summary = h.orchestrator.balance_of(&id("a")).await.unwrap();
    assert_eq!(summary.balance, d("40"));
    assert_eq!(summary.available, d("40"));

    h.orchestrator.reconcile(&id("a")).await.unwrap();
}

#[tokio::test]
async fn test_reconciliation_mismatch_freezes_account() {
    let h = setup().await;
    h.register("a", None).await;
    h.deposit("a", "100", "psp-1").await;
    assert_eq!(h.orchestrator.reconcile(&id("a")).await.unwrap(), d("100"));

    sqlx::query("UPDATE accounts SET wallet_balance = '250' WHERE id = ?")
        .bind("a")
        .execute(&h.pools.writer)
        .await
        .unwrap();

    let err = h.orchestrator.reconcile(&id("a")).await.unwrap_err();
    assert!(matches!(err, EngineError::ReconciliationMismatch { .. }));
    assert!(h.orchestrator.account(&id("a")).await.unwrap().ledger_frozen);

    let err = h
        .orchestrator
        .notify_deposit_confirmed(&id("a"), d("5"), "USD", "psp-2")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AccountFrozen(_)));
}

#[tokio::test]
async fn test_sweep_processes_unhandled_sources() {
    let h = setup().await;
    h.chain(&["a", "b"]).await;

    // A deposit that reached the ledger without going through post-processing.
    let wallet = WalletFacade::new(
        h.repo.clone(),
        h.orchestrator.config().currency.clone(),
        2,
        h.clock.clone(),
        EventBus::default(),
    );
    wallet
        .credit(
            EntryDraft::credit(id("b"), d("50"), EntryKind::Deposit)
                .with_idempotency_key("deposit:offline-1"),
        )
        .await
        .unwrap();
    assert_eq!(h.balance("a").await, Decimal::zero());

    let report = h.orchestrator.run_sweep(h.clock.now()).await.unwrap();
    assert_eq!(report.sources_processed, 1);
    assert_eq!(report.sources_failed, 0);
    assert_eq!(h.balance("a").await, d("5"));

    let report = h.orchestrator.run_sweep(h.clock.now()).await.unwrap();
    assert_eq!(report.sources_processed, 0);
    assert_eq!(h.balance("a").await, d("5"));
}

#[tokio::test]
async fn test_events_are_published() {
    let h = setup().await;
    h.register("a", None).await;
    let mut rx = h.orchestrator.events().subscribe();

    h.deposit("a", "10", "psp-1").await;

    let event = rx.recv().await.unwrap();
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "depositCredited");
    assert_eq!(json["account"], "a");
}
