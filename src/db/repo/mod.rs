//! Repository layer for database operations.
//!
//! This module provides the `Repository` struct for all database operations.
//! Methods are organized across submodules by domain:
//! - `mod.rs` - Accounts and the referral edges stored on them
//! - `ledger.rs` - Ledger entries, the `LedgerTx` write transaction, source processing
//! - `investments.rs` - Fixed-term investment records
//! - `matrix.rs` - Matrix positions and qualifications

mod investments;
mod ledger;
mod matrix;

pub use ledger::LedgerTx;
pub use matrix::QualificationOutcome;

use crate::db::DbPools;
use crate::domain::{Account, AccountId, AccountStatus, Decimal, ReferralCode, TimeMs};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::str::FromStr;

/// Repository for database operations.
#[derive(Debug, Clone)]
pub struct Repository {
    reader: SqlitePool,
    writer: SqlitePool,
}

impl Repository {
    /// Create a new repository over the given pools.
    pub fn new(pools: DbPools) -> Self {
        Repository {
            reader: pools.reader,
            writer: pools.writer,
        }
    }

    /// Round-trip a trivial query on the reader pool.
    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.reader).await?;
        Ok(())
    }

    // =========================================================================
    // Account operations
    // =========================================================================

    /// Insert a new account.
    ///
    /// # Errors
    /// Returns an error if the id or referral code is already taken.
    pub async fn insert_account(&self, account: &Account) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO accounts (id, referral_code, referrer_id, status, wallet_balance, ledger_frozen, created_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(account.id.as_str())
        .bind(account.referral_code.as_str())
        .bind(account.referrer_id.as_ref().map(|r| r.as_str()))
        .bind(account.status.as_str())
        .bind(account.wallet_balance.to_canonical_string())
        .bind(account.ledger_frozen)
        .bind(account.created_at.as_ms())
        .execute(&self.writer)
        .await?;

        Ok(())
    }

    pub async fn get_account(&self, id: &AccountId) -> Result<Option<Account>, sqlx::Error> {
        let row = sqlx::query(&format!("{} WHERE id = ?", ACCOUNT_SELECT))
            .bind(id.as_str())
            .fetch_optional(&self.reader)
            .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    pub async fn find_account_by_code(
        &self,
        code: &ReferralCode,
    ) -> Result<Option<Account>, sqlx::Error> {
        let row = sqlx::query(&format!("{} WHERE referral_code = ?", ACCOUNT_SELECT))
            .bind(code.as_str())
            .fetch_optional(&self.reader)
            .await?;

        row.as_ref().map(account_from_row).transpose()
    }

    pub async fn referral_code_exists(&self, code: &ReferralCode) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM accounts WHERE referral_code = ?")
            .bind(code.as_str())
            .fetch_optional(&self.reader)
            .await?;
        Ok(row.is_some())
    }

    /// Parent pointer and status of an account, or `None` if it does not exist.
    ///
    /// This is the single step of every ancestor walk.
    pub async fn placement_of(
        &self,
        id: &AccountId,
    ) -> Result<Option<(Option<AccountId>, AccountStatus)>, sqlx::Error> {
        let row = sqlx::query("SELECT referrer_id, status FROM accounts WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.reader)
            .await?;

        row.map(|r| {
            let referrer: Option<String> = r.try_get("referrer_id")?;
            let status = status_from_row(&r)?;
            Ok((referrer.map(AccountId::new), status))
        })
        .transpose()
    }

    /// Write a placement edge if the account has none yet.
    ///
    /// Returns `false` when the account already has a referrer (or does not exist).
    pub async fn set_referrer_once(
        &self,
        id: &AccountId,
        referrer: &AccountId,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE accounts SET referrer_id = ? WHERE id = ? AND referrer_id IS NULL",
        )
        .bind(referrer.as_str())
        .bind(id.as_str())
        .execute(&self.writer)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_account_status(
        &self,
        id: &AccountId,
        status: AccountStatus,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE accounts SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id.as_str())
            .execute(&self.writer)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_ledger_frozen(&self, id: &AccountId, frozen: bool) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE accounts SET ledger_frozen = ? WHERE id = ?")
            .bind(frozen)
            .bind(id.as_str())
            .execute(&self.writer)
            .await?;
        Ok(())
    }

    /// Accounts placed directly under `id`, oldest first.
    pub async fn direct_referrals(&self, id: &AccountId) -> Result<Vec<Account>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "{} WHERE referrer_id = ? ORDER BY created_at_ms ASC, id ASC",
            ACCOUNT_SELECT
        ))
        .bind(id.as_str())
        .fetch_all(&self.reader)
        .await?;

        rows.iter().map(account_from_row).collect()
    }
}

const ACCOUNT_SELECT: &str = r#"
    SELECT id, referral_code, referrer_id, status, wallet_balance, ledger_frozen, created_at_ms
    FROM accounts
"#;

fn account_from_row(row: &SqliteRow) -> Result<Account, sqlx::Error> {
    let id: String = row.try_get("id")?;
    let referral_code: String = row.try_get("referral_code")?;
    let referrer_id: Option<String> = row.try_get("referrer_id")?;
    let ledger_frozen: bool = row.try_get("ledger_frozen")?;
    let created_at_ms: i64 = row.try_get("created_at_ms")?;

    Ok(Account {
        id: AccountId::new(id),
        referral_code: ReferralCode::new(referral_code),
        referrer_id: referrer_id.map(AccountId::new),
        status: status_from_row(row)?,
        wallet_balance: decimal_col(row, "wallet_balance")?,
        ledger_frozen,
        created_at: TimeMs::new(created_at_ms),
    })
}

fn status_from_row(row: &SqliteRow) -> Result<AccountStatus, sqlx::Error> {
    let raw: String = row.try_get("status")?;
    AccountStatus::parse(&raw).ok_or_else(|| decode_error("status", &raw))
}

/// Read a decimal stored as canonical TEXT.
///
/// Money columns never fall back to a default: a corrupt amount is an error.
pub(crate) fn decimal_col(row: &SqliteRow, col: &str) -> Result<Decimal, sqlx::Error> {
    let raw: String = row.try_get(col)?;
    Decimal::from_str(&raw).map_err(|e| sqlx::Error::ColumnDecode {
        index: col.to_string(),
        source: Box::new(e),
    })
}

pub(crate) fn decode_error(col: &str, raw: &str) -> sqlx::Error {
    sqlx::Error::Decode(format!("unexpected value {:?} in column {}", raw, col).into())
}
