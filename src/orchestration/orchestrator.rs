use crate::config::Config;
use crate::db::Repository;
use crate::domain::{
    keys, Account, AccountId, AccountStatus, Currency, Decimal, EntryDraft, EntryId, EntryKind,
    FixedTermInvestment, LedgerEntry, MatrixPosition, Plan, PlanCatalog, PlanId, TimeMs,
};
use crate::engine::{
    Clock, CommissionDistributor, EngineEvent, EventBus, InvestmentEngine, InvestmentView,
    MatrixEngine, ReferralGraph, WalletFacade,
};
use crate::error::{EngineError, EngineResult};
use crate::orchestration::ensure::{SourceOutcome, SourceProcessor};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_PAGE_LIMIT: i64 = 50;
pub const MAX_PAGE_LIMIT: i64 = 500;
const MAX_ACCOUNT_ID_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdjustmentDirection {
    Credit,
    Debit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseOutcome {
    pub entry: LedgerEntry,
    pub investment: Option<FixedTermInvestment>,
    pub position: Option<MatrixPosition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceSummary {
    pub balance: Decimal,
    pub available: Decimal,
    pub currency: Currency,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerPage {
    pub entries: Vec<LedgerEntry>,
    pub total: i64,
    pub offset: i64,
    pub limit: i64,
}

/// One board as seen by a member: the open cycle plus every cycle before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardSummary {
    pub board_id: PlanId,
    pub required_referrals: u32,
    pub current: Option<MatrixPosition>,
    pub progress_pct: Decimal,
    pub history: Vec<MatrixPosition>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub sources_processed: usize,
    pub sources_failed: usize,
    pub investments_matured: usize,
    pub investments_closed: usize,
    pub boards_settled: usize,
    pub boards_failed: usize,
}

/// The external surface of the compensation core.
///
/// Every balance change goes through the wallet; qualifying entries are
/// post-processed right after they commit and retried by the sweep on failure.
pub struct Orchestrator {
    repo: Arc<Repository>,
    config: Config,
    clock: Arc<dyn Clock>,
    events: EventBus,
    wallet: Arc<WalletFacade>,
    graph: Arc<ReferralGraph>,
    investments: Arc<InvestmentEngine>,
    matrix: Arc<MatrixEngine>,
    processor: SourceProcessor,
}

impl Orchestrator {
    pub fn new(repo: Arc<Repository>, config: Config, clock: Arc<dyn Clock>) -> Self {
        let events = EventBus::default();
        let wallet = Arc::new(WalletFacade::new(
            repo.clone(),
            config.currency.clone(),
            config.minor_units,
            clock.clone(),
            events.clone(),
        ));
        let graph = Arc::new(ReferralGraph::new(
            repo.clone(),
            config.require_active_referrer,
        ));
        let commissions = Arc::new(CommissionDistributor::new(
            repo.clone(),
            graph.clone(),
            wallet.clone(),
            config.plans.clone(),
            config.deposit_commission.clone(),
            config.inactive_ancestor_policy,
            events.clone(),
        ));
        let investments = Arc::new(InvestmentEngine::new(
            repo.clone(),
            wallet.clone(),
            clock.clone(),
            events.clone(),
            config.auto_close_matured,
        ));
        let matrix = Arc::new(MatrixEngine::new(
            repo.clone(),
            wallet.clone(),
            config.plans.clone(),
            clock.clone(),
            events.clone(),
            config.reentry_funding,
        ));
        let processor = SourceProcessor::new(
            repo.clone(),
            config.plans.clone(),
            commissions,
            investments.clone(),
            matrix.clone(),
            clock.clone(),
        );

        Self {
            repo,
            config,
            clock,
            events,
            wallet,
            graph,
            investments,
            matrix,
            processor,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn plans(&self) -> &PlanCatalog {
        &self.config.plans
    }

    pub async fn ping(&self) -> EngineResult<()> {
        Ok(self.repo.ping().await?)
    }

    // =========================================================================
    // Consumed operations
    // =========================================================================

    /// Credit a confirmed gateway deposit. Redelivery of the same provider
    /// reference returns the original entry.
    pub async fn notify_deposit_confirmed(
        &self,
        account: &AccountId,
        amount: Decimal,
        currency: &str,
        provider_reference: &str,
    ) -> EngineResult<LedgerEntry> {
        self.validate_amount(amount)?;
        let currency = currency.trim().to_uppercase();
        if currency != self.config.currency.as_str() {
            return Err(EngineError::Validation(format!(
                "currency {} is not supported, expected {}",
                currency, self.config.currency
            )));
        }
        if provider_reference.trim().is_empty() {
            return Err(EngineError::Validation("providerReference is required".into()));
        }

        let draft = EntryDraft::credit(account.clone(), amount, EntryKind::Deposit)
            .with_idempotency_key(keys::deposit(provider_reference));
        let entry = match self.wallet.credit(draft).await {
            Ok(entry) => {
                self.events.publish(EngineEvent::DepositCredited {
                    account: account.clone(),
                    entry_id: entry.id.clone(),
                    amount: entry.amount,
                });
                entry
            }
            Err(EngineError::DuplicateEntry { entry_id }) => {
                let existing = self.entry(&entry_id).await?;
                if &existing.account_id != account || existing.amount != amount {
                    return Err(EngineError::InvalidState(format!(
                        "provider reference {} was already used for a different deposit",
                        provider_reference.trim()
                    )));
                }
                info!(account = %account, entry_id = %entry_id, "deposit redelivered");
                existing
            }
            Err(err) => return Err(err),
        };

        self.process_quietly(&entry).await;
        Ok(entry)
    }

    /// Record a pending withdrawal for the approval workflow.
    pub async fn request_withdrawal(
        &self,
        account: &AccountId,
        amount: Decimal,
        destination: &str,
    ) -> EngineResult<LedgerEntry> {
        self.validate_amount(amount)?;
        if destination.trim().is_empty() {
            return Err(EngineError::Validation("destination is required".into()));
        }
        let entry = self
            .wallet
            .request_withdrawal(account, amount, destination.trim())
            .await?;
        self.events.publish(EngineEvent::WithdrawalRequested {
            account: account.clone(),
            entry_id: entry.id.clone(),
            amount,
        });
        Ok(entry)
    }

    pub async fn resolve_withdrawal(
        &self,
        entry_id: &EntryId,
        approve: bool,
    ) -> EngineResult<LedgerEntry> {
        let entry = self.wallet.resolve_withdrawal(entry_id, approve).await?;
        self.events.publish(EngineEvent::WithdrawalResolved {
            account: entry.account_id.clone(),
            entry_id: entry.id.clone(),
            approved: approve,
        });
        Ok(entry)
    }

    pub async fn admin_adjust_balance(
        &self,
        account: &AccountId,
        amount: Decimal,
        direction: AdjustmentDirection,
        note: &str,
        admin_id: &str,
    ) -> EngineResult<LedgerEntry> {
        self.validate_amount(amount)?;
        if note.trim().is_empty() || admin_id.trim().is_empty() {
            return Err(EngineError::Validation("note and adminId are required".into()));
        }

        let memo = format!("{} (admin {})", note.trim(), admin_id.trim());
        let entry = match direction {
            AdjustmentDirection::Credit => {
                self.wallet
                    .credit(
                        EntryDraft::credit(account.clone(), amount, EntryKind::AdminAdjustment)
                            .with_memo(memo),
                    )
                    .await?
            }
            AdjustmentDirection::Debit => {
                self.wallet
                    .debit(
                        EntryDraft::debit(account.clone(), amount, EntryKind::AdminAdjustment)
                            .with_memo(memo),
                    )
                    .await?
            }
        };
        info!(
            account = %account,
            admin = admin_id.trim(),
            amount = %entry.amount,
            "admin adjustment"
        );
        Ok(entry)
    }

    /// Create an account, placed under the owner of `referrer_code` if given.
    pub async fn register_account(
        &self,
        account: &AccountId,
        referrer_code: Option<&str>,
    ) -> EngineResult<Account> {
        validate_account_id(account)?;
        let referrer = match referrer_code.map(str::trim).filter(|c| !c.is_empty()) {
            Some(code) => Some(self.graph.resolve_code(code).await?),
            None => None,
        };
        self.graph
            .register(account, referrer.as_ref(), self.clock.now())
            .await
    }

    /// Place an existing root account under the owner of `referrer_code`.
    pub async fn place_account(
        &self,
        account: &AccountId,
        referrer_code: &str,
    ) -> EngineResult<Account> {
        let referrer = self.graph.resolve_code(referrer_code).await?;
        self.graph.place(account, &referrer).await?;
        self.account(account).await
    }

    pub async fn set_account_status(
        &self,
        account: &AccountId,
        status: AccountStatus,
    ) -> EngineResult<Account> {
        if !self.repo.set_account_status(account, status).await? {
            return Err(EngineError::NotFound(format!("account {}", account)));
        }
        info!(account = %account, status = status.as_str(), "account status changed");
        self.account(account).await
    }

    /// Debit the purchase price and start the plan.
    ///
    /// The debit and the board-position check run under the account lock; the
    /// follow-up effects run after it is released and are retried by the sweep
    /// if they fail here.
    pub async fn purchase_plan(
        &self,
        account: &AccountId,
        plan_id: &PlanId,
        amount: Decimal,
    ) -> EngineResult<PurchaseOutcome> {
        let plan = self
            .config
            .plans
            .find(plan_id)
            .ok_or_else(|| EngineError::NotFound(format!("plan {}", plan_id)))?;
        self.validate_amount(amount)?;
        match plan {
            Plan::FixedTerm(p) if amount < p.min_amount || amount > p.max_amount => {
                return Err(EngineError::Validation(format!(
                    "amount for {} must be between {} and {}",
                    p.id, p.min_amount, p.max_amount
                )))
            }
            Plan::Matrix(b) if amount != b.price => {
                return Err(EngineError::Validation(format!(
                    "board {} costs {}",
                    b.id, b.price
                )))
            }
            _ => {}
        }

        let draft = EntryDraft::debit(account.clone(), amount, EntryKind::PlanPurchase)
            .with_plan(plan_id.clone());
        let guard = self.wallet.lock(account).await;
        if let Plan::Matrix(board) = plan {
            self.matrix.ensure_can_join(account, board).await?;
        }
        let entry = self
            .wallet
            .post_batch_locked(&guard, &[draft])
            .await?
            .pop()
            .ok_or_else(|| EngineError::InvalidState("empty ledger batch".into()))?;
        if let Plan::Matrix(board) = plan {
            if let Err(err) = self.matrix.open_position(&entry, board).await {
                warn!(entry_id = %entry.id, error = %err, "board position not opened");
            }
        }
        drop(guard);

        info!(account = %account, plan = %plan_id, amount = %amount, "plan purchased");
        let outcome = self.process_quietly(&entry).await;
        Ok(PurchaseOutcome {
            entry,
            investment: outcome.investment,
            position: outcome.position,
        })
    }

    pub async fn payout_investment(
        &self,
        investment_id: i64,
    ) -> EngineResult<(FixedTermInvestment, LedgerEntry)> {
        self.investments.payout(investment_id).await
    }

    // =========================================================================
    // Exposed queries
    // =========================================================================

    pub async fn account(&self, account: &AccountId) -> EngineResult<Account> {
        self.repo
            .get_account(account)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("account {}", account)))
    }

    pub async fn balance_of(&self, account: &AccountId) -> EngineResult<BalanceSummary> {
        Ok(BalanceSummary {
            balance: self.wallet.balance_of(account).await?,
            available: self.wallet.available_balance(account).await?,
            currency: self.config.currency.clone(),
        })
    }

    /// A page of the account's ledger, newest first.
    pub async fn ledger_of(
        &self,
        account: &AccountId,
        offset: Option<i64>,
        limit: Option<i64>,
    ) -> EngineResult<LedgerPage> {
        self.account(account).await?;
        let offset = offset.unwrap_or(0);
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if offset < 0 {
            return Err(EngineError::Validation("offset must be >= 0".into()));
        }
        if !(1..=MAX_PAGE_LIMIT).contains(&limit) {
            return Err(EngineError::Validation(format!(
                "limit must be between 1 and {}",
                MAX_PAGE_LIMIT
            )));
        }

        Ok(LedgerPage {
            entries: self.repo.ledger_page(account, offset, limit).await?,
            total: self.repo.count_entries(account).await?,
            offset,
            limit,
        })
    }

    pub async fn investments_of(&self, account: &AccountId) -> EngineResult<Vec<InvestmentView>> {
        self.account(account).await?;
        self.investments.investments_of(account).await
    }

    pub async fn matrix_position_of(&self, account: &AccountId) -> EngineResult<Vec<BoardSummary>> {
        self.account(account).await?;
        let positions = self.matrix.positions_of(account).await?;

        let mut boards: Vec<BoardSummary> = Vec::new();
        for position in positions {
            match boards.last_mut() {
                Some(board) if board.board_id == position.board_id => board.history.push(position),
                _ => boards.push(BoardSummary {
                    board_id: position.board_id.clone(),
                    required_referrals: self
                        .config
                        .plans
                        .board(&position.board_id)
                        .map(|b| b.required_referrals)
                        .unwrap_or(0),
                    current: None,
                    progress_pct: Decimal::zero(),
                    history: vec![position],
                }),
            }
        }
        for board in &mut boards {
            board.current = board.history.iter().rev().find(|p| p.is_open()).cloned();
            board.progress_pct = board
                .current
                .as_ref()
                .map(|p| p.progress_pct(board.required_referrals).round_half_up(2))
                .unwrap_or_else(Decimal::zero);
        }
        Ok(boards)
    }

    pub async fn referrals_of(&self, account: &AccountId) -> EngineResult<Vec<Account>> {
        self.account(account).await?;
        self.graph.referrals_of(account).await
    }

    pub async fn upline_of(&self, account: &AccountId) -> EngineResult<Vec<AccountId>> {
        self.graph.placements(account).await
    }

    /// Verify the cached balance against the ledger; freezes the account on mismatch.
    pub async fn reconcile(&self, account: &AccountId) -> EngineResult<Decimal> {
        self.wallet.reconcile(account).await
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Re-run post-processing for one source entry.
    pub async fn process_source_entry(&self, entry_id: &EntryId) -> EngineResult<SourceOutcome> {
        let entry = self.entry(entry_id).await?;
        self.processor.ensure_processed(&entry).await
    }

    /// Repair interrupted work and persist time-based transitions.
    pub async fn run_sweep(&self, now: TimeMs) -> EngineResult<SweepReport> {
        let sources = self.processor.ensure_all_processed().await?;
        let investments = self.investments.sweep(now).await?;

        let mut report = SweepReport {
            sources_processed: sources.processed,
            sources_failed: sources.failed,
            investments_matured: investments.matured,
            investments_closed: investments.closed,
            ..SweepReport::default()
        };
        for position in self.matrix.unsettled().await? {
            match self.matrix.settle(position.id).await {
                Ok(Some(_)) => report.boards_settled += 1,
                Ok(None) => {}
                Err(err) => {
                    report.boards_failed += 1;
                    warn!(
                        account = %position.account_id,
                        position_id = position.id,
                        error = %err,
                        "board settlement failed"
                    );
                }
            }
        }
        Ok(report)
    }

    async fn process_quietly(&self, entry: &LedgerEntry) -> SourceOutcome {
        match self.processor.ensure_processed(entry).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    entry_id = %entry.id,
                    error = %err,
                    "post-processing deferred to sweep"
                );
                SourceOutcome::default()
            }
        }
    }

    async fn entry(&self, entry_id: &EntryId) -> EngineResult<LedgerEntry> {
        self.repo
            .get_entry(entry_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("entry {}", entry_id)))
    }

    fn validate_amount(&self, amount: Decimal) -> EngineResult<()> {
        if !amount.is_positive() {
            return Err(EngineError::Validation("amount must be positive".into()));
        }
        if !amount.fits_scale(self.config.minor_units) {
            return Err(EngineError::Validation(format!(
                "amount {} has more than {} decimal places",
                amount, self.config.minor_units
            )));
        }
        Ok(())
    }
}

fn validate_account_id(account: &AccountId) -> EngineResult<()> {
    let raw = account.as_str();
    if raw.is_empty() || raw.len() > MAX_ACCOUNT_ID_LEN || raw.trim() != raw {
        return Err(EngineError::Validation(format!(
            "account id must be 1 to {} characters without surrounding spaces",
            MAX_ACCOUNT_ID_LEN
        )));
    }
    Ok(())
}
