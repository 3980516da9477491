//! Ledger entry persistence.

use super::{decimal_col, decode_error, Repository};
use crate::domain::{
    AccountId, Currency, Decimal, EntryDraft, EntryId, EntryKind, EntryStatus, LedgerEntry,
    PlanId, TimeMs,
};
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::{Row, Transaction};

const ENTRY_COLUMNS: &str = r#"
    seq, id, account_id, amount, currency, kind, status, source_entry_id, level,
    idempotency_key, plan_id, memo, created_at_ms, resolved_at_ms
"#;

/// A write transaction on the ledger.
///
/// Every balance-affecting change happens inside one of these so that the
/// duplicate check, the funds check, the entry insert and the cached-balance
/// update commit or roll back together. Dropping without `commit` rolls back.
pub struct LedgerTx {
    tx: Transaction<'static, Sqlite>,
}

impl Repository {
    /// Begin a ledger write transaction on the writer connection.
    pub async fn begin_ledger_tx(&self) -> Result<LedgerTx, sqlx::Error> {
        Ok(LedgerTx {
            tx: self.writer.begin().await?,
        })
    }

    pub async fn get_entry(&self, id: &EntryId) -> Result<Option<LedgerEntry>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ledger_entries WHERE id = ?",
            ENTRY_COLUMNS
        ))
        .bind(id.as_str())
        .fetch_optional(&self.reader)
        .await?;

        row.as_ref().map(entry_from_row).transpose()
    }

    /// A page of an account's ledger, newest first.
    pub async fn ledger_page(
        &self,
        account: &AccountId,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ledger_entries WHERE account_id = ? ORDER BY seq DESC LIMIT ? OFFSET ?",
            ENTRY_COLUMNS
        ))
        .bind(account.as_str())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.reader)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    pub async fn count_entries(&self, account: &AccountId) -> Result<i64, sqlx::Error> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM ledger_entries WHERE account_id = ?")
            .bind(account.as_str())
            .fetch_one(&self.reader)
            .await?;
        row.try_get("n")
    }

    /// Sum of all completed entries for an account.
    ///
    /// # Implementation Note
    ///
    /// We iterate in Rust to preserve decimal precision. SQLite's SUM aggregate
    /// function returns REAL (float), which would lose precision for financial
    /// calculations.
    pub async fn sum_completed(&self, account: &AccountId) -> Result<Decimal, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT amount FROM ledger_entries
            WHERE account_id = ? AND status = 'completed'
            ORDER BY seq ASC
            "#,
        )
        .bind(account.as_str())
        .fetch_all(&self.reader)
        .await?;

        let amounts = rows
            .iter()
            .map(|row| decimal_col(row, "amount"))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Decimal::sum(amounts))
    }

    /// Sum of pending withdrawals (negative) for an account.
    pub async fn pending_withdrawals(&self, account: &AccountId) -> Result<Decimal, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT amount FROM ledger_entries WHERE account_id = ? AND kind = 'withdrawal' AND status = 'pending'",
        )
        .bind(account.as_str())
        .fetch_all(&self.reader)
        .await?;

        let amounts = rows
            .iter()
            .map(|row| decimal_col(row, "amount"))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Decimal::sum(amounts))
    }

    /// Entries caused by `source`, in arrival order.
    pub async fn entries_by_source(
        &self,
        source: &EntryId,
    ) -> Result<Vec<LedgerEntry>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ledger_entries WHERE source_entry_id = ? ORDER BY seq ASC",
            ENTRY_COLUMNS
        ))
        .bind(source.as_str())
        .fetch_all(&self.reader)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    /// Completed qualifying source entries that have not finished post-processing.
    pub async fn unprocessed_sources(&self, limit: i64) -> Result<Vec<LedgerEntry>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM ledger_entries e
            WHERE e.status = 'completed'
              AND e.kind IN ('deposit', 'plan_purchase')
              AND NOT EXISTS (SELECT 1 FROM source_processing p WHERE p.entry_id = e.id)
            ORDER BY e.seq ASC
            LIMIT ?
            "#,
            ENTRY_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.reader)
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    pub async fn mark_source_processed(
        &self,
        entry: &EntryId,
        at: TimeMs,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO source_processing (entry_id, processed_at_ms) VALUES (?, ?) ON CONFLICT(entry_id) DO NOTHING",
        )
        .bind(entry.as_str())
        .bind(at.as_ms())
        .execute(&self.writer)
        .await?;
        Ok(())
    }

    pub async fn is_source_processed(&self, entry: &EntryId) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM source_processing WHERE entry_id = ?")
            .bind(entry.as_str())
            .fetch_optional(&self.reader)
            .await?;
        Ok(row.is_some())
    }
}

impl LedgerTx {
    /// Cached balance and frozen flag, or `None` if the account does not exist.
    pub async fn account_state(
        &mut self,
        account: &AccountId,
    ) -> Result<Option<(Decimal, bool)>, sqlx::Error> {
        let row = sqlx::query("SELECT wallet_balance, ledger_frozen FROM accounts WHERE id = ?")
            .bind(account.as_str())
            .fetch_optional(&mut *self.tx)
            .await?;

        row.map(|r| {
            let frozen: bool = r.try_get("ledger_frozen")?;
            Ok((decimal_col(&r, "wallet_balance")?, frozen))
        })
        .transpose()
    }

    /// An existing entry that makes `draft` a duplicate: same idempotency key, or a
    /// completed entry with the same (source, kind, level).
    pub async fn find_duplicate(
        &mut self,
        draft: &EntryDraft,
    ) -> Result<Option<LedgerEntry>, sqlx::Error> {
        if let Some(key) = &draft.idempotency_key {
            let row = sqlx::query(&format!(
                "SELECT {} FROM ledger_entries WHERE idempotency_key = ?",
                ENTRY_COLUMNS
            ))
            .bind(key.as_str())
            .fetch_optional(&mut *self.tx)
            .await?;
            if let Some(row) = row {
                return entry_from_row(&row).map(Some);
            }
        }

        if let Some(source) = &draft.source_entry_id {
            let row = sqlx::query(&format!(
                r#"
                SELECT {} FROM ledger_entries
                WHERE source_entry_id = ? AND kind = ? AND level = ? AND status = 'completed'
                "#,
                ENTRY_COLUMNS
            ))
            .bind(source.as_str())
            .bind(draft.kind.as_str())
            .bind(draft.level)
            .fetch_optional(&mut *self.tx)
            .await?;
            if let Some(row) = row {
                return entry_from_row(&row).map(Some);
            }
        }

        Ok(None)
    }

    /// Sum of pending withdrawals (negative) for an account.
    pub async fn pending_withdrawals(&mut self, account: &AccountId) -> Result<Decimal, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT amount FROM ledger_entries WHERE account_id = ? AND kind = 'withdrawal' AND status = 'pending'",
        )
        .bind(account.as_str())
        .fetch_all(&mut *self.tx)
        .await?;

        let amounts = rows
            .iter()
            .map(|row| decimal_col(row, "amount"))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Decimal::sum(amounts))
    }

    pub async fn get_entry(&mut self, id: &EntryId) -> Result<Option<LedgerEntry>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ledger_entries WHERE id = ?",
            ENTRY_COLUMNS
        ))
        .bind(id.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(entry_from_row).transpose()
    }

    /// Insert a new entry built from `draft` and return it with its sequence number.
    pub async fn insert_entry(
        &mut self,
        draft: &EntryDraft,
        currency: &Currency,
        now: TimeMs,
    ) -> Result<LedgerEntry, sqlx::Error> {
        let id = EntryId::generate();
        let resolved_at = (draft.status != EntryStatus::Pending).then_some(now);

        let result = sqlx::query(
            r#"
            INSERT INTO ledger_entries (
                id, account_id, amount, currency, kind, status, source_entry_id, level,
                idempotency_key, plan_id, memo, created_at_ms, resolved_at_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(draft.account_id.as_str())
        .bind(draft.amount.to_canonical_string())
        .bind(currency.as_str())
        .bind(draft.kind.as_str())
        .bind(draft.status.as_str())
        .bind(draft.source_entry_id.as_ref().map(|s| s.as_str()))
        .bind(draft.level)
        .bind(draft.idempotency_key.as_deref())
        .bind(draft.plan_id.as_ref().map(|p| p.as_str()))
        .bind(draft.memo.as_deref())
        .bind(now.as_ms())
        .bind(resolved_at.map(|t| t.as_ms()))
        .execute(&mut *self.tx)
        .await?;

        Ok(LedgerEntry {
            seq: result.last_insert_rowid(),
            id,
            account_id: draft.account_id.clone(),
            amount: draft.amount,
            currency: currency.clone(),
            kind: draft.kind,
            status: draft.status,
            source_entry_id: draft.source_entry_id.clone(),
            level: draft.level,
            idempotency_key: draft.idempotency_key.clone(),
            plan_id: draft.plan_id.clone(),
            memo: draft.memo.clone(),
            created_at: now,
            resolved_at,
        })
    }

    /// Move a pending entry to a terminal status. Returns `false` if it was not pending.
    pub async fn resolve_pending(
        &mut self,
        id: &EntryId,
        status: EntryStatus,
        now: TimeMs,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE ledger_entries SET status = ?, resolved_at_ms = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(now.as_ms())
        .bind(id.as_str())
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_cached_balance(
        &mut self,
        account: &AccountId,
        balance: Decimal,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE accounts SET wallet_balance = ? WHERE id = ?")
            .bind(balance.to_canonical_string())
            .bind(account.as_str())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn commit(self) -> Result<(), sqlx::Error> {
        self.tx.commit().await
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<LedgerEntry, sqlx::Error> {
    let kind_raw: String = row.try_get("kind")?;
    let status_raw: String = row.try_get("status")?;
    let level: i64 = row.try_get("level")?;
    let source_entry_id: Option<String> = row.try_get("source_entry_id")?;
    let plan_id: Option<String> = row.try_get("plan_id")?;
    let resolved_at_ms: Option<i64> = row.try_get("resolved_at_ms")?;

    Ok(LedgerEntry {
        seq: row.try_get("seq")?,
        id: EntryId::new(row.try_get::<String, _>("id")?),
        account_id: AccountId::new(row.try_get::<String, _>("account_id")?),
        amount: decimal_col(row, "amount")?,
        currency: Currency::new(row.try_get::<String, _>("currency")?),
        kind: EntryKind::parse(&kind_raw).ok_or_else(|| decode_error("kind", &kind_raw))?,
        status: EntryStatus::parse(&status_raw)
            .ok_or_else(|| decode_error("status", &status_raw))?,
        source_entry_id: source_entry_id.map(EntryId::new),
        level: u32::try_from(level).map_err(|_| decode_error("level", &level.to_string()))?,
        idempotency_key: row.try_get("idempotency_key")?,
        plan_id: plan_id.map(PlanId::new),
        memo: row.try_get("memo")?,
        created_at: TimeMs::new(row.try_get("created_at_ms")?),
        resolved_at: resolved_at_ms.map(TimeMs::new),
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{account, setup_test_db};
    use super::*;
    use std::str::FromStr;

    fn usd() -> Currency {
        Currency::new("USD")
    }

    #[tokio::test]
    async fn test_insert_entry_and_read_back() {
        let (repo, _temp) = setup_test_db().await;
        repo.insert_account(&account("a", None)).await.unwrap();
        let a = AccountId::new("a");

        let draft = EntryDraft::credit(a.clone(), Decimal::from_i64(100), EntryKind::Deposit)
            .with_idempotency_key("deposit:ref-1");
        let mut tx = repo.begin_ledger_tx().await.unwrap();
        let entry = tx.insert_entry(&draft, &usd(), TimeMs::new(5)).await.unwrap();
        tx.set_cached_balance(&a, entry.amount).await.unwrap();
        tx.commit().await.unwrap();

        let loaded = repo.get_entry(&entry.id).await.unwrap().unwrap();
        assert_eq!(loaded, entry);
        assert_eq!(repo.sum_completed(&a).await.unwrap(), Decimal::from_i64(100));
        assert_eq!(repo.count_entries(&a).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_find_duplicate_by_key_and_source() {
        let (repo, _temp) = setup_test_db().await;
        repo.insert_account(&account("a", None)).await.unwrap();
        let a = AccountId::new("a");
        let source = EntryId::new("src-1");

        let draft = EntryDraft::credit(a.clone(), Decimal::from_i64(10), EntryKind::Commission)
            .with_source(source.clone(), 1);

        let mut tx = repo.begin_ledger_tx().await.unwrap();
        assert!(tx.find_duplicate(&draft).await.unwrap().is_none());
        let first = tx.insert_entry(&draft, &usd(), TimeMs::new(1)).await.unwrap();
        let dup = tx.find_duplicate(&draft).await.unwrap();
        assert_eq!(dup.map(|e| e.id), Some(first.id));

        let other_level = EntryDraft::credit(a.clone(), Decimal::from_i64(10), EntryKind::Commission)
            .with_source(source, 2);
        assert!(tx.find_duplicate(&other_level).await.unwrap().is_none());
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_unique_index_blocks_second_completed_commission() {
        let (repo, _temp) = setup_test_db().await;
        repo.insert_account(&account("a", None)).await.unwrap();
        let draft = EntryDraft::credit(
            AccountId::new("a"),
            Decimal::from_i64(10),
            EntryKind::Commission,
        )
        .with_source(EntryId::new("src-1"), 1);

        let mut tx = repo.begin_ledger_tx().await.unwrap();
        tx.insert_entry(&draft, &usd(), TimeMs::new(1)).await.unwrap();
        assert!(tx.insert_entry(&draft, &usd(), TimeMs::new(2)).await.is_err());
    }

    #[tokio::test]
    async fn test_resolve_pending_only_once() {
        let (repo, _temp) = setup_test_db().await;
        repo.insert_account(&account("a", None)).await.unwrap();
        let a = AccountId::new("a");
        let draft = EntryDraft::debit(a.clone(), Decimal::from_str("12.5").unwrap(), EntryKind::Withdrawal)
            .pending();

        let mut tx = repo.begin_ledger_tx().await.unwrap();
        let entry = tx.insert_entry(&draft, &usd(), TimeMs::new(1)).await.unwrap();
        assert!(entry.resolved_at.is_none());
        assert_eq!(
            tx.pending_withdrawals(&a).await.unwrap(),
            Decimal::from_str("-12.5").unwrap()
        );
        assert!(tx
            .resolve_pending(&entry.id, EntryStatus::Rejected, TimeMs::new(2))
            .await
            .unwrap());
        assert!(!tx
            .resolve_pending(&entry.id, EntryStatus::Completed, TimeMs::new(3))
            .await
            .unwrap());
        tx.commit().await.unwrap();

        let loaded = repo.get_entry(&entry.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, EntryStatus::Rejected);
        assert!(repo.sum_completed(&a).await.unwrap().is_zero());
    }

    #[tokio::test]
    async fn test_sums_split_completed_and_pending() {
        let (repo, _temp) = setup_test_db().await;
        repo.insert_account(&account("a", None)).await.unwrap();
        let a = AccountId::new("a");
        let d = |s: &str| Decimal::from_str(s).unwrap();

        let mut tx = repo.begin_ledger_tx().await.unwrap();
        for draft in [
            EntryDraft::credit(a.clone(), d("100.25"), EntryKind::Deposit),
            EntryDraft::debit(a.clone(), d("40.1"), EntryKind::AdminAdjustment),
            EntryDraft::debit(a.clone(), d("10"), EntryKind::Withdrawal).pending(),
            EntryDraft::debit(a.clone(), d("5.05"), EntryKind::Withdrawal).pending(),
        ] {
            tx.insert_entry(&draft, &usd(), TimeMs::new(1)).await.unwrap();
        }
        tx.commit().await.unwrap();

        assert_eq!(repo.sum_completed(&a).await.unwrap(), d("60.15"));
        assert_eq!(repo.pending_withdrawals(&a).await.unwrap(), d("-15.05"));
    }

    #[tokio::test]
    async fn test_unprocessed_sources() {
        let (repo, _temp) = setup_test_db().await;
        repo.insert_account(&account("a", None)).await.unwrap();
        let a = AccountId::new("a");

        let mut tx = repo.begin_ledger_tx().await.unwrap();
        let deposit = tx
            .insert_entry(
                &EntryDraft::credit(a.clone(), Decimal::from_i64(50), EntryKind::Deposit),
                &usd(),
                TimeMs::new(1),
            )
            .await
            .unwrap();
        tx.insert_entry(
            &EntryDraft::credit(a.clone(), Decimal::from_i64(5), EntryKind::AdminAdjustment),
            &usd(),
            TimeMs::new(2),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let pending = repo.unprocessed_sources(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, deposit.id);

        repo.mark_source_processed(&deposit.id, TimeMs::new(3))
            .await
            .unwrap();
        repo.mark_source_processed(&deposit.id, TimeMs::new(4))
            .await
            .unwrap();
        assert!(repo.is_source_processed(&deposit.id).await.unwrap());
        assert!(repo.unprocessed_sources(10).await.unwrap().is_empty());
    }
}
