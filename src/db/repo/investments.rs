//! Fixed-term investment persistence.

use super::{decimal_col, decode_error, Repository};
use crate::domain::{
    AccountId, Decimal, EntryId, FixedTermInvestment, InvestmentStatus, PlanId, TimeMs, DAY_MS,
};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

const INVESTMENT_SELECT: &str = r#"
    SELECT id, account_id, plan_id, funding_entry_id, principal, monthly_rate_pct,
           duration_days, start_at_ms, status, payout_entry_id, closed_at_ms
    FROM investments
"#;

impl Repository {
    /// Create a `pending` investment for a funding entry, or return the existing one.
    ///
    /// Keyed on `funding_entry_id`, so replays never create a second record.
    pub async fn insert_investment_if_absent(
        &self,
        account: &AccountId,
        plan: &PlanId,
        funding_entry: &EntryId,
        principal: Decimal,
        monthly_rate_pct: Decimal,
        duration_days: u32,
    ) -> Result<FixedTermInvestment, sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO investments (
                account_id, plan_id, funding_entry_id, principal, monthly_rate_pct,
                duration_days, status
            ) VALUES (?, ?, ?, ?, ?, ?, 'pending')
            ON CONFLICT(funding_entry_id) DO NOTHING
            "#,
        )
        .bind(account.as_str())
        .bind(plan.as_str())
        .bind(funding_entry.as_str())
        .bind(principal.to_canonical_string())
        .bind(monthly_rate_pct.to_canonical_string())
        .bind(duration_days)
        .execute(&self.writer)
        .await?;

        let row = sqlx::query(&format!("{} WHERE funding_entry_id = ?", INVESTMENT_SELECT))
            .bind(funding_entry.as_str())
            .fetch_one(&self.writer)
            .await?;
        investment_from_row(&row)
    }

    pub async fn get_investment(
        &self,
        id: i64,
    ) -> Result<Option<FixedTermInvestment>, sqlx::Error> {
        let row = sqlx::query(&format!("{} WHERE id = ?", INVESTMENT_SELECT))
            .bind(id)
            .fetch_optional(&self.reader)
            .await?;
        row.as_ref().map(investment_from_row).transpose()
    }

    pub async fn investments_of(
        &self,
        account: &AccountId,
    ) -> Result<Vec<FixedTermInvestment>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "{} WHERE account_id = ? ORDER BY id ASC",
            INVESTMENT_SELECT
        ))
        .bind(account.as_str())
        .fetch_all(&self.reader)
        .await?;
        rows.iter().map(investment_from_row).collect()
    }

    /// `pending -> active`. Returns `false` if the investment was not pending.
    pub async fn activate_investment(&self, id: i64, start: TimeMs) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE investments SET status = 'active', start_at_ms = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(start.as_ms())
        .bind(id)
        .execute(&self.writer)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// `active -> matured`. Returns `false` if the investment was not active.
    pub async fn mark_investment_matured(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE investments SET status = 'matured' WHERE id = ? AND status = 'active'",
        )
        .bind(id)
        .execute(&self.writer)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// `active|matured -> closed`. Returns `false` if already closed or still pending.
    pub async fn close_investment(
        &self,
        id: i64,
        payout_entry: &EntryId,
        at: TimeMs,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE investments SET status = 'closed', payout_entry_id = ?, closed_at_ms = ?
            WHERE id = ? AND status IN ('active', 'matured')
            "#,
        )
        .bind(payout_entry.as_str())
        .bind(at.as_ms())
        .bind(id)
        .execute(&self.writer)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Active investments whose maturity instant is at or before `now`.
    pub async fn due_investments(
        &self,
        now: TimeMs,
    ) -> Result<Vec<FixedTermInvestment>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "{} WHERE status = 'active' AND start_at_ms + duration_days * ? <= ? ORDER BY id ASC",
            INVESTMENT_SELECT
        ))
        .bind(DAY_MS)
        .bind(now.as_ms())
        .fetch_all(&self.reader)
        .await?;
        rows.iter().map(investment_from_row).collect()
    }

    /// Investments already marked matured and not yet paid out.
    pub async fn matured_investments(&self) -> Result<Vec<FixedTermInvestment>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "{} WHERE status = 'matured' ORDER BY id ASC",
            INVESTMENT_SELECT
        ))
        .fetch_all(&self.reader)
        .await?;
        rows.iter().map(investment_from_row).collect()
    }
}

fn investment_from_row(row: &SqliteRow) -> Result<FixedTermInvestment, sqlx::Error> {
    let status_raw: String = row.try_get("status")?;
    let duration_days: i64 = row.try_get("duration_days")?;
    let start_at_ms: Option<i64> = row.try_get("start_at_ms")?;
    let payout_entry_id: Option<String> = row.try_get("payout_entry_id")?;
    let closed_at_ms: Option<i64> = row.try_get("closed_at_ms")?;

    Ok(FixedTermInvestment {
        id: row.try_get("id")?,
        account_id: AccountId::new(row.try_get::<String, _>("account_id")?),
        plan_id: PlanId::new(row.try_get::<String, _>("plan_id")?),
        funding_entry_id: EntryId::new(row.try_get::<String, _>("funding_entry_id")?),
        principal: decimal_col(row, "principal")?,
        monthly_rate_pct: decimal_col(row, "monthly_rate_pct")?,
        duration_days: u32::try_from(duration_days)
            .map_err(|_| decode_error("duration_days", &duration_days.to_string()))?,
        start_at: start_at_ms.map(TimeMs::new),
        status: InvestmentStatus::parse(&status_raw)
            .ok_or_else(|| decode_error("status", &status_raw))?,
        payout_entry_id: payout_entry_id.map(EntryId::new),
        closed_at: closed_at_ms.map(TimeMs::new),
    })
}
