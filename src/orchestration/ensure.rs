use crate::db::Repository;
use crate::domain::{
    EntryKind, EntryStatus, FixedTermInvestment, LedgerEntry, MatrixPosition, Plan, PlanCatalog,
};
use crate::engine::{Clock, CommissionDistributor, InvestmentEngine, MatrixEngine};
use crate::error::{EngineError, EngineResult};
use std::sync::Arc;
use tracing::{info, warn};

/// Entries scanned per sweep pass.
pub const SOURCE_BATCH: i64 = 200;

/// What post-processing of one source entry produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceOutcome {
    pub commissions: Vec<LedgerEntry>,
    pub investment: Option<FixedTermInvestment>,
    pub position: Option<MatrixPosition>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceSweep {
    pub processed: usize,
    pub failed: usize,
}

/// Runs the follow-up effects of a completed deposit or plan purchase and
/// records completion, so that a crash between the ledger write and its
/// effects is repaired by the next sweep.
pub struct SourceProcessor {
    repo: Arc<Repository>,
    catalog: PlanCatalog,
    commissions: Arc<CommissionDistributor>,
    investments: Arc<InvestmentEngine>,
    matrix: Arc<MatrixEngine>,
    clock: Arc<dyn Clock>,
}

impl SourceProcessor {
    pub fn new(
        repo: Arc<Repository>,
        catalog: PlanCatalog,
        commissions: Arc<CommissionDistributor>,
        investments: Arc<InvestmentEngine>,
        matrix: Arc<MatrixEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            catalog,
            commissions,
            investments,
            matrix,
            clock,
        }
    }

    /// Apply every effect of `entry`. Each step is idempotent, so this is safe
    /// to call again for an entry that was already processed.
    pub async fn ensure_processed(&self, entry: &LedgerEntry) -> EngineResult<SourceOutcome> {
        if !entry.kind.is_qualifying_source() || entry.status != EntryStatus::Completed {
            return Err(EngineError::InvalidState(format!(
                "entry {} is not a completed deposit or plan purchase",
                entry.id
            )));
        }

        let mut outcome = SourceOutcome::default();
        let mut first_error = None;

        if entry.kind == EntryKind::PlanPurchase {
            match self.apply_plan(entry, &mut outcome).await {
                Ok(()) => {}
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match self.commissions.distribute(entry).await {
            Ok(paid) => outcome.commissions = paid,
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        self.repo
            .mark_source_processed(&entry.id, self.clock.now())
            .await?;
        Ok(outcome)
    }

    async fn apply_plan(&self, entry: &LedgerEntry, outcome: &mut SourceOutcome) -> EngineResult<()> {
        let plan_id = entry
            .plan_id
            .as_ref()
            .ok_or_else(|| EngineError::InvalidState(format!("purchase {} has no plan", entry.id)))?;
        match self.catalog.find(plan_id) {
            Some(Plan::FixedTerm(plan)) => {
                outcome.investment = Some(self.investments.on_purchase(entry, plan).await?);
            }
            Some(Plan::Matrix(board)) => {
                outcome.position = Some(self.matrix.join(entry, board).await?);
            }
            None => return Err(EngineError::NotFound(format!("plan {}", plan_id))),
        }
        Ok(())
    }

    /// Retry source entries that never finished post-processing.
    pub async fn ensure_all_processed(&self) -> EngineResult<SourceSweep> {
        let mut report = SourceSweep::default();
        for entry in self.repo.unprocessed_sources(SOURCE_BATCH).await? {
            match self.ensure_processed(&entry).await {
                Ok(_) => report.processed += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(entry_id = %entry.id, error = %err, "source processing failed");
                }
            }
        }
        if report.processed > 0 {
            info!(processed = report.processed, "recovered unprocessed source entries");
        }
        Ok(report)
    }
}
