//! Postgres-backed account store
//!
//! The conditional update is a single guarded UPDATE; classification of a
//! missed update (version conflict vs. insufficient funds vs. gone) happens
//! with a follow-up read, since the guard itself cannot tell them apart.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::Balance;

use super::{Account, AccountStore, NewAccount, StoreError};

type AccountRow = (Uuid, Uuid, String, i64, i64, bool, DateTime<Utc>);

const SELECT_ACCOUNT: &str = r#"
    SELECT id, owner_id, account_number, balance, version, is_active, created_at
    FROM accounts
"#;

/// Account store backed by the `accounts` table.
#[derive(Debug, Clone)]
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn from_row(row: AccountRow) -> Result<Account, StoreError> {
        let (id, owner_id, account_number, balance, version, is_active, created_at) = row;
        let balance = Balance::new(balance)
            .map_err(|e| StoreError::InvalidBalance(format!("account {}: {}", id, e)))?;

        Ok(Account {
            id,
            owner_id,
            account_number,
            balance,
            version,
            is_active,
            created_at,
        })
    }

    /// Read the raw row regardless of active status, for failure
    /// classification after a missed conditional update.
    async fn fetch_any(&self, id: Uuid) -> Result<Option<Account>, StoreError> {
        let row: Option<AccountRow> =
            sqlx::query_as(&format!("{} WHERE id = $1", SELECT_ACCOUNT))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(Self::from_row).transpose()
    }
}

impl AccountStore for PgAccountStore {
    async fn get(&self, id: Uuid) -> Result<Account, StoreError> {
        let account = self
            .fetch_any(id)
            .await?
            .filter(|a| a.is_active)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        Ok(account)
    }

    async fn get_by_number(&self, account_number: &str) -> Result<Account, StoreError> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "{} WHERE account_number = $1 AND is_active",
            SELECT_ACCOUNT
        ))
        .bind(account_number)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| StoreError::NotFound(account_number.to_string()))?;
        Self::from_row(row)
    }

    async fn create(&self, new_account: NewAccount) -> Result<Account, StoreError> {
        let row: AccountRow = sqlx::query_as(
            r#"
            INSERT INTO accounts (id, owner_id, account_number, balance, version, is_active)
            VALUES ($1, $2, $3, 0, 1, true)
            RETURNING id, owner_id, account_number, balance, version, is_active, created_at
            "#,
        )
        .bind(new_account.id)
        .bind(new_account.owner_id)
        .bind(&new_account.account_number)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::DuplicateAccountNumber(new_account.account_number.clone())
            }
            _ => StoreError::Database(e),
        })?;

        Self::from_row(row)
    }

    async fn conditional_update(
        &self,
        id: Uuid,
        expected_version: i64,
        delta: i64,
    ) -> Result<Account, StoreError> {
        let row: Option<AccountRow> = sqlx::query_as(
            r#"
            UPDATE accounts
            SET balance = balance + $3, version = version + 1, updated_at = NOW()
            WHERE id = $1 AND version = $2 AND is_active AND balance + $3 >= 0
            RETURNING id, owner_id, account_number, balance, version, is_active, created_at
            "#,
        )
        .bind(id)
        .bind(expected_version)
        .bind(delta)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Self::from_row(row);
        }

        // The guard rejected the update; read back to say why.
        let current = self
            .fetch_any(id)
            .await?
            .filter(|a| a.is_active)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                account_id: id,
                expected: expected_version,
                actual: current.version,
            });
        }

        Err(StoreError::InsufficientFunds {
            account_id: id,
            delta,
            balance: current.balance.minor_units(),
        })
    }

    async fn deactivate(&self, id: Uuid) -> Result<(), StoreError> {
        let rows = sqlx::query(
            "UPDATE accounts SET is_active = false, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }

        Ok(())
    }
}
