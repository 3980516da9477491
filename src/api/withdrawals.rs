use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use super::{parse_amount, AppState, EntryDto};
use crate::domain::{AccountId, EntryId};
use crate::error::AppError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalRequest {
    pub account_id: String,
    pub amount: String,
    pub destination: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    pub approve: bool,
}

pub async fn request_withdrawal(
    State(state): State<AppState>,
    Json(body): Json<WithdrawalRequest>,
) -> Result<(StatusCode, Json<EntryDto>), AppError> {
    let amount = parse_amount(&body.amount)?;
    let entry = state
        .orchestrator
        .request_withdrawal(&AccountId::new(body.account_id), amount, &body.destination)
        .await?;
    Ok((StatusCode::CREATED, Json(entry.into())))
}

pub async fn resolve_withdrawal(
    Path(entry_id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<ResolveRequest>,
) -> Result<Json<EntryDto>, AppError> {
    let entry = state
        .orchestrator
        .resolve_withdrawal(&EntryId::new(entry_id), body.approve)
        .await?;
    Ok(Json(entry.into()))
}
