//! Compensation engines.
//!
//! - `wallet` - the only write path into the ledger, per-account serialization
//! - `referral` - placement forest and ancestor walks
//! - `commission` - levelled commission fan-out
//! - `investment` - fixed-term accrual lifecycle
//! - `matrix` - forced-matrix fill, payout and re-entry

pub mod clock;
pub mod commission;
pub mod events;
pub mod investment;
pub mod matrix;
pub mod referral;
pub mod wallet;

pub use clock::{Clock, ManualClock, SystemClock};
pub use commission::CommissionDistributor;
pub use events::{EngineEvent, EventBus};
pub use investment::{InvestmentEngine, InvestmentSweep, InvestmentView};
pub use matrix::MatrixEngine;
pub use referral::ReferralGraph;
pub use wallet::{AccountGuard, WalletFacade};
