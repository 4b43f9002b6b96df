//! Ledger
//!
//! Append-only log of balance-affecting operations, one entry per account
//! per operation. Entries are immutable once written and durable before the
//! engine acknowledges success; corrections are made by appending
//! compensating entries, never by mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

/// Kind of balance-affecting operation a ledger entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Deposit,
    Withdrawal,
    TransferDebit,
    TransferCredit,
    /// Reversal of a debit whose matching credit could not be applied
    Compensation,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Deposit => "deposit",
            EntryKind::Withdrawal => "withdrawal",
            EntryKind::TransferDebit => "transfer_debit",
            EntryKind::TransferCredit => "transfer_credit",
            EntryKind::Compensation => "compensation",
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntryKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(EntryKind::Deposit),
            "withdrawal" => Ok(EntryKind::Withdrawal),
            "transfer_debit" => Ok(EntryKind::TransferDebit),
            "transfer_credit" => Ok(EntryKind::TransferCredit),
            "compensation" => Ok(EntryKind::Compensation),
            other => Err(LedgerError::InvalidEntryKind(other.to_string())),
        }
    }
}

/// Immutable record of one balance-affecting event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub account_id: Uuid,
    /// Logical operation this entry belongs to; shared by the debit and
    /// credit legs of a transfer.
    pub operation_id: Uuid,
    pub kind: EntryKind,
    /// Signed change applied to the balance, in minor units.
    pub delta: i64,
    pub previous_balance: i64,
    pub new_balance: i64,
    pub created_at: DateTime<Utc>,
}

/// Entry to be appended. The id and timestamp are assigned by the ledger.
#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub account_id: Uuid,
    pub operation_id: Uuid,
    pub kind: EntryKind,
    pub delta: i64,
    pub previous_balance: i64,
    pub new_balance: i64,
}

/// Ledger errors
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Unknown ledger entry kind: {0}")]
    InvalidEntryKind(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Append-only storage contract for ledger entries.
#[allow(async_fn_in_trait)]
pub trait Ledger {
    /// Durably append an entry and return its id.
    async fn append(&self, entry: NewLedgerEntry) -> Result<Uuid, LedgerError>;

    /// Entries for one account, ordered by creation, paginated.
    async fn entries_for_account(
        &self,
        account_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// Total number of entries for one account.
    async fn count_for_account(&self, account_id: Uuid) -> Result<i64, LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_entry_kind_round_trip() {
        for kind in [
            EntryKind::Deposit,
            EntryKind::Withdrawal,
            EntryKind::TransferDebit,
            EntryKind::TransferCredit,
            EntryKind::Compensation,
        ] {
            assert_eq!(EntryKind::from_str(kind.as_str()).unwrap(), kind);
        }
    }

    #[test]
    fn test_entry_kind_unknown() {
        let result = EntryKind::from_str("chargeback");
        assert!(matches!(result, Err(LedgerError::InvalidEntryKind(_))));
    }

    #[test]
    fn test_entry_kind_serde() {
        let json = serde_json::to_string(&EntryKind::TransferDebit).unwrap();
        assert_eq!(json, r#""transfer_debit""#);
    }
}
