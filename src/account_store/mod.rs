//! Account Store
//!
//! Durable mapping from account identifier to balance and version. The
//! conditional update is the only concurrency primitive in the system:
//! each account is mutated independently through a per-record
//! compare-and-swap, never through cross-account locks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::Balance;

mod memory;
mod postgres;

pub use memory::MemoryAccountStore;
pub use postgres::PgAccountStore;

/// A bank account as durably stored.
///
/// Balance is non-negative at every durable state; version increases by
/// exactly one per applied update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub account_number: String,
    pub balance: Balance,
    pub version: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Parameters for creating an account. Accounts start active with a zero
/// balance at version 1.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub account_number: String,
}

/// Errors from account store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Account unknown or soft-deactivated
    #[error("Account not found: {0}")]
    NotFound(String),

    /// Stored version did not match the expected version
    #[error("Version conflict for account {account_id}: expected {expected}, found {actual}")]
    VersionConflict {
        account_id: Uuid,
        expected: i64,
        actual: i64,
    },

    /// Applying the delta would take the balance negative
    #[error("Insufficient funds in account {account_id}: delta {delta}, balance {balance}")]
    InsufficientFunds {
        account_id: Uuid,
        delta: i64,
        balance: i64,
    },

    /// Account number collision on create
    #[error("Account number already exists: {0}")]
    DuplicateAccountNumber(String),

    /// A stored balance violated the domain invariants
    #[error("Invalid stored balance: {0}")]
    InvalidBalance(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Check if this error is a version conflict (transient, retryable)
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }
}

/// Storage contract for accounts.
///
/// `conditional_update` applies a signed delta only if the stored version
/// equals `expected_version` and the resulting balance stays non-negative;
/// otherwise it fails with no side effects, letting the caller re-read and
/// retry.
#[allow(async_fn_in_trait)]
pub trait AccountStore {
    /// Fetch an account by id. Deactivated accounts report `NotFound`.
    async fn get(&self, id: Uuid) -> Result<Account, StoreError>;

    /// Fetch an account by its public account number.
    async fn get_by_number(&self, account_number: &str) -> Result<Account, StoreError>;

    /// Create a new active account with zero balance at version 1.
    async fn create(&self, new_account: NewAccount) -> Result<Account, StoreError>;

    /// Atomically apply `delta` if the version matches and the resulting
    /// balance is non-negative. Returns the updated account.
    async fn conditional_update(
        &self,
        id: Uuid,
        expected_version: i64,
        delta: i64,
    ) -> Result<Account, StoreError>;

    /// Soft-deactivate an account. Accounts are never physically deleted.
    async fn deactivate(&self, id: Uuid) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_is_retryable() {
        let conflict = StoreError::VersionConflict {
            account_id: Uuid::new_v4(),
            expected: 1,
            actual: 2,
        };
        assert!(conflict.is_retryable());

        let not_found = StoreError::NotFound(Uuid::new_v4().to_string());
        assert!(!not_found.is_retryable());

        let insufficient = StoreError::InsufficientFunds {
            account_id: Uuid::new_v4(),
            delta: -100,
            balance: 50,
        };
        assert!(!insufficient.is_retryable());
    }
}
