//! External operations of the compensation core and its maintenance loop.

pub mod ensure;
pub mod orchestrator;
pub mod sweep;

pub use ensure::{SourceOutcome, SourceProcessor};
pub use orchestrator::{
    AdjustmentDirection, BalanceSummary, BoardSummary, LedgerPage, Orchestrator, PurchaseOutcome,
    SweepReport,
};
pub use sweep::spawn_sweep;
