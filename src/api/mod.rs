pub mod accounts;
pub mod admin;
pub mod deposits;
pub mod health;
pub mod plans;
pub mod withdrawals;

use crate::domain::{Decimal, LedgerEntry};
use crate::error::AppError;
use crate::orchestration::Orchestrator;
use axum::{
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/v1/accounts", post(accounts::register_account))
        .route("/v1/accounts/:id/placement", post(accounts::place_account))
        .route("/v1/accounts/:id/balance", get(accounts::get_balance))
        .route("/v1/accounts/:id/ledger", get(accounts::get_ledger))
        .route("/v1/accounts/:id/referrals", get(accounts::get_referrals))
        .route("/v1/accounts/:id/investments", get(accounts::get_investments))
        .route("/v1/accounts/:id/matrix", get(accounts::get_matrix))
        .route("/v1/deposits/confirm", post(deposits::confirm_deposit))
        .route("/v1/withdrawals", post(withdrawals::request_withdrawal))
        .route(
            "/v1/withdrawals/:entry_id/resolve",
            post(withdrawals::resolve_withdrawal),
        )
        .route("/v1/plans", get(plans::get_plans))
        .route("/v1/plans/purchase", post(plans::purchase_plan))
        .route("/v1/investments/:id/payout", post(plans::payout_investment))
        .route("/v1/admin/adjustments", post(admin::adjust_balance))
        .route("/v1/admin/accounts/:id/status", post(admin::set_status))
        .route("/v1/admin/accounts/:id/reconcile", post(admin::reconcile))
        .layer(cors)
        .with_state(state)
}

/// Ledger entry as returned over HTTP.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryDto {
    pub id: String,
    pub seq: i64,
    pub account_id: String,
    pub amount: String,
    pub currency: String,
    pub kind: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_entry_id: Option<String>,
    pub level: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    pub created_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at_ms: Option<i64>,
}

impl From<LedgerEntry> for EntryDto {
    fn from(e: LedgerEntry) -> Self {
        EntryDto {
            id: e.id.to_string(),
            seq: e.seq,
            account_id: e.account_id.to_string(),
            amount: e.amount.to_canonical_string(),
            currency: e.currency.to_string(),
            kind: e.kind.as_str().to_string(),
            status: e.status.as_str().to_string(),
            source_entry_id: e.source_entry_id.map(|s| s.to_string()),
            level: e.level,
            plan_id: e.plan_id.map(|p| p.to_string()),
            memo: e.memo,
            created_at_ms: e.created_at.as_ms(),
            resolved_at_ms: e.resolved_at.map(|t| t.as_ms()),
        }
    }
}

/// Parse a decimal amount sent as a JSON string.
pub(crate) fn parse_amount(raw: &str) -> Result<Decimal, AppError> {
    Decimal::from_str(raw.trim())
        .map_err(|_| AppError::BadRequest(format!("invalid amount {:?}", raw)))
}
