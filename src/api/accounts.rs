use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::{AppState, EntryDto};
use crate::domain::{Account, AccountId, MatrixPosition};
use crate::engine::InvestmentView;
use crate::error::AppError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub account_id: String,
    pub referral_code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementRequest {
    pub referral_code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerQuery {
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountDto {
    pub id: String,
    pub referral_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer_id: Option<String>,
    pub status: String,
    pub wallet_balance: String,
    pub ledger_frozen: bool,
    pub created_at_ms: i64,
}

impl From<Account> for AccountDto {
    fn from(a: Account) -> Self {
        AccountDto {
            id: a.id.to_string(),
            referral_code: a.referral_code.to_string(),
            referrer_id: a.referrer_id.map(|r| r.to_string()),
            status: a.status.as_str().to_string(),
            wallet_balance: a.wallet_balance.to_canonical_string(),
            ledger_frozen: a.ledger_frozen,
            created_at_ms: a.created_at.as_ms(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub account_id: String,
    pub balance: String,
    pub available: String,
    pub currency: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerResponse {
    pub account_id: String,
    pub total: i64,
    pub offset: i64,
    pub limit: i64,
    pub entries: Vec<EntryDto>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralsResponse {
    pub account_id: String,
    /// Nearest ancestor first, at most five.
    pub upline: Vec<String>,
    pub referrals: Vec<AccountDto>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestmentsResponse {
    pub account_id: String,
    pub investments: Vec<InvestmentView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixResponse {
    pub account_id: String,
    pub boards: Vec<BoardDto>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardDto {
    pub board_id: String,
    pub required_referrals: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<MatrixPosition>,
    pub progress_pct: String,
    pub history: Vec<MatrixPosition>,
}

pub async fn register_account(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AccountDto>), AppError> {
    let account = state
        .orchestrator
        .register_account(
            &AccountId::new(body.account_id),
            body.referral_code.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(account.into())))
}

pub async fn place_account(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<PlacementRequest>,
) -> Result<Json<AccountDto>, AppError> {
    let account = state
        .orchestrator
        .place_account(&AccountId::new(id), &body.referral_code)
        .await?;
    Ok(Json(account.into()))
}

pub async fn get_balance(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<BalanceResponse>, AppError> {
    let account = AccountId::new(id);
    let summary = state.orchestrator.balance_of(&account).await?;
    Ok(Json(BalanceResponse {
        account_id: account.to_string(),
        balance: summary.balance.to_canonical_string(),
        available: summary.available.to_canonical_string(),
        currency: summary.currency.to_string(),
    }))
}

pub async fn get_ledger(
    Path(id): Path<String>,
    Query(params): Query<LedgerQuery>,
    State(state): State<AppState>,
) -> Result<Json<LedgerResponse>, AppError> {
    let account = AccountId::new(id);
    let page = state
        .orchestrator
        .ledger_of(&account, params.offset, params.limit)
        .await?;
    Ok(Json(LedgerResponse {
        account_id: account.to_string(),
        total: page.total,
        offset: page.offset,
        limit: page.limit,
        entries: page.entries.into_iter().map(EntryDto::from).collect(),
    }))
}

pub async fn get_referrals(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ReferralsResponse>, AppError> {
    let account = AccountId::new(id);
    let (referrals, upline) = futures::try_join!(
        state.orchestrator.referrals_of(&account),
        state.orchestrator.upline_of(&account),
    )?;
    Ok(Json(ReferralsResponse {
        account_id: account.to_string(),
        upline: upline.into_iter().map(|a| a.to_string()).collect(),
        referrals: referrals.into_iter().map(AccountDto::from).collect(),
    }))
}

pub async fn get_investments(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<InvestmentsResponse>, AppError> {
    let account = AccountId::new(id);
    let investments = state.orchestrator.investments_of(&account).await?;
    Ok(Json(InvestmentsResponse {
        account_id: account.to_string(),
        investments,
    }))
}

pub async fn get_matrix(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<MatrixResponse>, AppError> {
    let account = AccountId::new(id);
    let boards = state.orchestrator.matrix_position_of(&account).await?;
    Ok(Json(MatrixResponse {
        account_id: account.to_string(),
        boards: boards
            .into_iter()
            .map(|b| BoardDto {
                board_id: b.board_id.to_string(),
                required_referrals: b.required_referrals,
                current: b.current,
                progress_pct: b.progress_pct.to_canonical_string(),
                history: b.history,
            })
            .collect(),
    }))
}
