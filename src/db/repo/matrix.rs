//! Matrix position persistence.

use super::{decode_error, Repository};
use crate::domain::{AccountId, EntryId, MatrixPosition, MatrixStatus, PlanId, TimeMs};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

const POSITION_SELECT: &str = r#"
    SELECT id, account_id, board_id, cycle, qualified_count, status, source_entry_id,
           created_at_ms, completed_at_ms
    FROM matrix_positions
"#;

/// Result of counting a referee's board join toward its referrer's position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QualificationOutcome {
    /// Counted; carries the referrer's position after the update.
    Counted(MatrixPosition),
    /// This referee already qualified on this board.
    AlreadyCounted,
    /// The referrer holds no filling position on this board.
    NoOpenPosition,
}

impl Repository {
    /// Create the position for (account, board, cycle) or return the existing one.
    pub async fn insert_position_if_absent(
        &self,
        account: &AccountId,
        board: &PlanId,
        cycle: u32,
        source_entry: &EntryId,
        now: TimeMs,
    ) -> Result<MatrixPosition, sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO matrix_positions (account_id, board_id, cycle, qualified_count, status, source_entry_id, created_at_ms)
            VALUES (?, ?, ?, 0, 'filling', ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(account.as_str())
        .bind(board.as_str())
        .bind(cycle)
        .bind(source_entry.as_str())
        .bind(now.as_ms())
        .execute(&self.writer)
        .await?;

        let row = sqlx::query(&format!(
            "{} WHERE account_id = ? AND board_id = ? AND cycle = ?",
            POSITION_SELECT
        ))
        .bind(account.as_str())
        .bind(board.as_str())
        .bind(cycle)
        .fetch_one(&self.writer)
        .await?;
        position_from_row(&row)
    }

    pub async fn get_position(&self, id: i64) -> Result<Option<MatrixPosition>, sqlx::Error> {
        let row = sqlx::query(&format!("{} WHERE id = ?", POSITION_SELECT))
            .bind(id)
            .fetch_optional(&self.reader)
            .await?;
        row.as_ref().map(position_from_row).transpose()
    }

    /// The newest cycle an account holds on a board, whatever its status.
    pub async fn latest_position(
        &self,
        account: &AccountId,
        board: &PlanId,
    ) -> Result<Option<MatrixPosition>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "{} WHERE account_id = ? AND board_id = ? ORDER BY cycle DESC LIMIT 1",
            POSITION_SELECT
        ))
        .bind(account.as_str())
        .bind(board.as_str())
        .fetch_optional(&self.reader)
        .await?;
        row.as_ref().map(position_from_row).transpose()
    }

    /// Every position an account has held, grouped by board, oldest cycle first.
    pub async fn positions_of(
        &self,
        account: &AccountId,
    ) -> Result<Vec<MatrixPosition>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "{} WHERE account_id = ? ORDER BY board_id ASC, cycle ASC",
            POSITION_SELECT
        ))
        .bind(account.as_str())
        .fetch_all(&self.reader)
        .await?;
        rows.iter().map(position_from_row).collect()
    }

    /// Positions whose threshold was reached but whose settlement has not been applied.
    pub async fn completed_positions(&self) -> Result<Vec<MatrixPosition>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "{} WHERE status = 'completed' ORDER BY id ASC",
            POSITION_SELECT
        ))
        .fetch_all(&self.reader)
        .await?;
        rows.iter().map(position_from_row).collect()
    }

    /// Count `referee`'s join of `board` toward `referrer`'s filling position.
    ///
    /// Only a position opened at or before `joined_at` is eligible. Insert,
    /// recount and status update happen in one transaction. The position flips
    /// to `completed` when the count reaches `required`.
    pub async fn record_qualification(
        &self,
        board: &PlanId,
        referrer: &AccountId,
        referee: &AccountId,
        required: u32,
        joined_at: TimeMs,
        now: TimeMs,
    ) -> Result<QualificationOutcome, sqlx::Error> {
        let mut tx = self.writer.begin().await?;

        let already = sqlx::query(
            "SELECT 1 FROM matrix_qualifications WHERE board_id = ? AND referee_id = ?",
        )
        .bind(board.as_str())
        .bind(referee.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        if already.is_some() {
            return Ok(QualificationOutcome::AlreadyCounted);
        }

        let row = sqlx::query(&format!(
            "{} WHERE account_id = ? AND board_id = ? AND status = 'filling' AND created_at_ms <= ? ORDER BY cycle DESC LIMIT 1",
            POSITION_SELECT
        ))
        .bind(referrer.as_str())
        .bind(board.as_str())
        .bind(joined_at.as_ms())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(QualificationOutcome::NoOpenPosition);
        };
        let position = position_from_row(&row)?;

        sqlx::query(
            "INSERT INTO matrix_qualifications (board_id, referee_id, position_id, created_at_ms) VALUES (?, ?, ?, ?)",
        )
        .bind(board.as_str())
        .bind(referee.as_str())
        .bind(position.id)
        .bind(now.as_ms())
        .execute(&mut *tx)
        .await?;

        let count: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM matrix_qualifications WHERE position_id = ?",
        )
        .bind(position.id)
        .fetch_one(&mut *tx)
        .await?
        .try_get("n")?;

        let reached = count >= i64::from(required);
        sqlx::query(
            r#"
            UPDATE matrix_positions
            SET qualified_count = ?,
                status = CASE WHEN ? THEN 'completed' ELSE status END,
                completed_at_ms = CASE WHEN ? THEN ? ELSE completed_at_ms END
            WHERE id = ?
            "#,
        )
        .bind(count)
        .bind(reached)
        .bind(reached)
        .bind(now.as_ms())
        .bind(position.id)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!("{} WHERE id = ?", POSITION_SELECT))
            .bind(position.id)
            .fetch_one(&mut *tx)
            .await?;
        let updated = position_from_row(&row)?;

        tx.commit().await?;
        Ok(QualificationOutcome::Counted(updated))
    }

    /// Close a settled cycle and open the next one, funded by `next_source`.
    ///
    /// Idempotent: replaying after a crash finds the old cycle already
    /// re-entered and the next cycle already present.
    pub async fn roll_over_position(
        &self,
        position: &MatrixPosition,
        next_source: &EntryId,
        now: TimeMs,
    ) -> Result<MatrixPosition, sqlx::Error> {
        let mut tx = self.writer.begin().await?;

        sqlx::query(
            "UPDATE matrix_positions SET status = 're_entered' WHERE id = ? AND status = 'completed'",
        )
        .bind(position.id)
        .execute(&mut *tx)
        .await?;

        let next_cycle = position.cycle + 1;
        sqlx::query(
            r#"
            INSERT INTO matrix_positions (account_id, board_id, cycle, qualified_count, status, source_entry_id, created_at_ms)
            VALUES (?, ?, ?, 0, 'filling', ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(position.account_id.as_str())
        .bind(position.board_id.as_str())
        .bind(next_cycle)
        .bind(next_source.as_str())
        .bind(now.as_ms())
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!(
            "{} WHERE account_id = ? AND board_id = ? AND cycle = ?",
            POSITION_SELECT
        ))
        .bind(position.account_id.as_str())
        .bind(position.board_id.as_str())
        .bind(next_cycle)
        .fetch_one(&mut *tx)
        .await?;
        let next = position_from_row(&row)?;

        tx.commit().await?;
        Ok(next)
    }
}

fn position_from_row(row: &SqliteRow) -> Result<MatrixPosition, sqlx::Error> {
    let status_raw: String = row.try_get("status")?;
    let cycle: i64 = row.try_get("cycle")?;
    let qualified_count: i64 = row.try_get("qualified_count")?;
    let completed_at_ms: Option<i64> = row.try_get("completed_at_ms")?;

    Ok(MatrixPosition {
        id: row.try_get("id")?,
        account_id: AccountId::new(row.try_get::<String, _>("account_id")?),
        board_id: PlanId::new(row.try_get::<String, _>("board_id")?),
        cycle: u32::try_from(cycle).map_err(|_| decode_error("cycle", &cycle.to_string()))?,
        qualified_count: u32::try_from(qualified_count)
            .map_err(|_| decode_error("qualified_count", &qualified_count.to_string()))?,
        status: MatrixStatus::parse(&status_raw)
            .ok_or_else(|| decode_error("status", &status_raw))?,
        source_entry_id: EntryId::new(row.try_get::<String, _>("source_entry_id")?),
        created_at: TimeMs::new(row.try_get("created_at_ms")?),
        completed_at: completed_at_ms.map(TimeMs::new),
    })
}
