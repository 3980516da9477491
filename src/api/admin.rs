use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::accounts::AccountDto;
use super::{parse_amount, AppState, EntryDto};
use crate::domain::{AccountId, AccountStatus};
use crate::error::AppError;
use crate::orchestration::AdjustmentDirection;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustmentRequest {
    pub account_id: String,
    pub amount: String,
    pub direction: AdjustmentDirection,
    pub note: String,
    pub admin_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRequest {
    pub status: AccountStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileResponse {
    pub account_id: String,
    pub balance: String,
    pub reconciled: bool,
}

pub async fn adjust_balance(
    State(state): State<AppState>,
    Json(body): Json<AdjustmentRequest>,
) -> Result<Json<EntryDto>, AppError> {
    let amount = parse_amount(&body.amount)?;
    let entry = state
        .orchestrator
        .admin_adjust_balance(
            &AccountId::new(body.account_id),
            amount,
            body.direction,
            &body.note,
            &body.admin_id,
        )
        .await?;
    Ok(Json(entry.into()))
}

pub async fn set_status(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<StatusRequest>,
) -> Result<Json<AccountDto>, AppError> {
    let account = state
        .orchestrator
        .set_account_status(&AccountId::new(id), body.status)
        .await?;
    Ok(Json(account.into()))
}

pub async fn reconcile(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ReconcileResponse>, AppError> {
    let account = AccountId::new(id);
    let balance = state.orchestrator.reconcile(&account).await?;
    Ok(Json(ReconcileResponse {
        account_id: account.to_string(),
        balance: balance.to_canonical_string(),
        reconciled: true,
    }))
}
