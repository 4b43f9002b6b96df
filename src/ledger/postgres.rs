//! Postgres-backed ledger
//!
//! Entries live in the `ledger_entries` table; the table has no UPDATE or
//! DELETE path anywhere in the codebase.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::str::FromStr;
use uuid::Uuid;

use super::{EntryKind, Ledger, LedgerEntry, LedgerError, NewLedgerEntry};

type EntryRow = (Uuid, Uuid, Uuid, String, i64, i64, i64, DateTime<Utc>);

/// Ledger backed by the `ledger_entries` table.
#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn from_row(row: EntryRow) -> Result<LedgerEntry, LedgerError> {
        let (id, account_id, operation_id, kind, delta, previous_balance, new_balance, created_at) =
            row;

        Ok(LedgerEntry {
            id,
            account_id,
            operation_id,
            kind: EntryKind::from_str(&kind)?,
            delta,
            previous_balance,
            new_balance,
            created_at,
        })
    }
}

impl Ledger for PgLedger {
    async fn append(&self, entry: NewLedgerEntry) -> Result<Uuid, LedgerError> {
        let entry_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO ledger_entries (
                account_id, operation_id, kind, delta, previous_balance, new_balance
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(entry.account_id)
        .bind(entry.operation_id)
        .bind(entry.kind.as_str())
        .bind(entry.delta)
        .bind(entry.previous_balance)
        .bind(entry.new_balance)
        .fetch_one(&self.pool)
        .await?;

        Ok(entry_id)
    }

    async fn entries_for_account(
        &self,
        account_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let rows: Vec<EntryRow> = sqlx::query_as(
            r#"
            SELECT id, account_id, operation_id, kind, delta, previous_balance, new_balance, created_at
            FROM ledger_entries
            WHERE account_id = $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(account_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::from_row).collect()
    }

    async fn count_for_account(&self, account_id: Uuid) -> Result<i64, LedgerError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM ledger_entries WHERE account_id = $1")
                .bind(account_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }
}
