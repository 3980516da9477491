use crate::domain::{AccountId, Decimal, EntryId};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failures raised by the engines and the orchestration layer.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid placement: {0}")]
    InvalidPlacement(String),
    /// The effect was already applied; carries the existing entry.
    #[error("Duplicate entry: already recorded as {entry_id}")]
    DuplicateEntry { entry_id: EntryId },
    #[error("Insufficient funds on {account}: requested {requested}, available {available}")]
    InsufficientFunds {
        account: AccountId,
        requested: Decimal,
        available: Decimal,
    },
    #[error("Reconciliation mismatch on {account}: cached {cached}, ledger {ledger}")]
    ReconciliationMismatch {
        account: AccountId,
        cached: Decimal,
        ledger: Decimal,
    },
    #[error("Ledger frozen for account {0}")]
    AccountFrozen(AccountId),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Engine(EngineError::Db(err))
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Engine(err) => match err {
                EngineError::InvalidPlacement(_) | EngineError::Validation(_) => {
                    StatusCode::BAD_REQUEST
                }
                EngineError::InsufficientFunds { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                EngineError::NotFound(_) => StatusCode::NOT_FOUND,
                EngineError::InvalidState(_) | EngineError::DuplicateEntry { .. } => {
                    StatusCode::CONFLICT
                }
                EngineError::AccountFrozen(_) => StatusCode::LOCKED,
                EngineError::ReconciliationMismatch { .. } | EngineError::Db(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = Json(json!({
            "error": self.to_string(),
        }));

        (status, body).into_response()
    }
}
