use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::{parse_amount, AppState, EntryDto};
use crate::domain::{AccountId, FixedTermInvestment, MatrixPosition, PlanCatalog, PlanId};
use crate::error::AppError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRequest {
    pub account_id: String,
    pub plan_id: String,
    pub amount: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseResponse {
    pub entry: EntryDto,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub investment: Option<FixedTermInvestment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<MatrixPosition>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutResponse {
    pub investment: FixedTermInvestment,
    pub entry: EntryDto,
}

pub async fn get_plans(State(state): State<AppState>) -> Json<PlanCatalog> {
    Json(state.orchestrator.plans().clone())
}

pub async fn purchase_plan(
    State(state): State<AppState>,
    Json(body): Json<PurchaseRequest>,
) -> Result<(StatusCode, Json<PurchaseResponse>), AppError> {
    let amount = parse_amount(&body.amount)?;
    let outcome = state
        .orchestrator
        .purchase_plan(
            &AccountId::new(body.account_id),
            &PlanId::new(body.plan_id),
            amount,
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(PurchaseResponse {
            entry: outcome.entry.into(),
            investment: outcome.investment,
            position: outcome.position,
        }),
    ))
}

pub async fn payout_investment(
    Path(id): Path<i64>,
    State(state): State<AppState>,
) -> Result<Json<PayoutResponse>, AppError> {
    let (investment, entry) = state.orchestrator.payout_investment(id).await?;
    Ok(Json(PayoutResponse {
        investment,
        entry: entry.into(),
    }))
}
