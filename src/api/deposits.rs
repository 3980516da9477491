use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use super::{parse_amount, AppState, EntryDto};
use crate::domain::AccountId;
use crate::error::AppError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmDepositRequest {
    pub account_id: String,
    pub amount: String,
    pub currency: String,
    pub provider_reference: String,
}

/// Gateway callback. Safe to deliver more than once per provider reference.
pub async fn confirm_deposit(
    State(state): State<AppState>,
    Json(body): Json<ConfirmDepositRequest>,
) -> Result<Json<EntryDto>, AppError> {
    let amount = parse_amount(&body.amount)?;
    let entry = state
        .orchestrator
        .notify_deposit_confirmed(
            &AccountId::new(body.account_id),
            amount,
            &body.currency,
            &body.provider_reference,
        )
        .await?;
    Ok(Json(entry.into()))
}
