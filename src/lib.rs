pub mod api;
pub mod config;
pub mod db;
pub mod domain;
pub mod engine;
pub mod error;
pub mod orchestration;

pub use config::Config;
pub use db::{init_db, Repository};
pub use domain::{
    Account, AccountId, AccountStatus, Decimal, EntryId, EntryKind, EntryStatus, LedgerEntry,
    PlanId, TimeMs,
};
pub use engine::{Clock, ManualClock, SystemClock};
pub use error::{AppError, EngineError, EngineResult};
pub use orchestration::{spawn_sweep, Orchestrator};
