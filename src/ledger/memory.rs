//! In-memory ledger
//!
//! Append-only vector behind a mutex. Used by the engine tests and local
//! development.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use uuid::Uuid;

use super::{Ledger, LedgerEntry, LedgerError, NewLedgerEntry};

/// Ledger holding all entries in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    entries: Arc<Mutex<Vec<LedgerEntry>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Ledger for MemoryLedger {
    async fn append(&self, entry: NewLedgerEntry) -> Result<Uuid, LedgerError> {
        let mut entries = self.entries.lock().expect("ledger lock poisoned");

        let stored = LedgerEntry {
            id: Uuid::new_v4(),
            account_id: entry.account_id,
            operation_id: entry.operation_id,
            kind: entry.kind,
            delta: entry.delta,
            previous_balance: entry.previous_balance,
            new_balance: entry.new_balance,
            created_at: Utc::now(),
        };
        let id = stored.id;
        entries.push(stored);

        Ok(id)
    }

    async fn entries_for_account(
        &self,
        account_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let entries = self.entries.lock().expect("ledger lock poisoned");

        Ok(entries
            .iter()
            .filter(|e| e.account_id == account_id)
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn count_for_account(&self, account_id: Uuid) -> Result<i64, LedgerError> {
        let entries = self.entries.lock().expect("ledger lock poisoned");
        Ok(entries.iter().filter(|e| e.account_id == account_id).count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::EntryKind;

    fn entry(account_id: Uuid, delta: i64, previous: i64) -> NewLedgerEntry {
        NewLedgerEntry {
            account_id,
            operation_id: Uuid::new_v4(),
            kind: if delta >= 0 {
                EntryKind::Deposit
            } else {
                EntryKind::Withdrawal
            },
            delta,
            previous_balance: previous,
            new_balance: previous + delta,
        }
    }

    #[tokio::test]
    async fn test_append_and_list() {
        let ledger = MemoryLedger::new();
        let account_id = Uuid::new_v4();

        ledger.append(entry(account_id, 100, 0)).await.unwrap();
        ledger.append(entry(account_id, -30, 100)).await.unwrap();
        ledger.append(entry(Uuid::new_v4(), 50, 0)).await.unwrap();

        let entries = ledger
            .entries_for_account(account_id, 50, 0)
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].delta, 100);
        assert_eq!(entries[1].delta, -30);

        assert_eq!(ledger.count_for_account(account_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_pagination() {
        let ledger = MemoryLedger::new();
        let account_id = Uuid::new_v4();

        for i in 0..5 {
            ledger.append(entry(account_id, 10, i * 10)).await.unwrap();
        }

        let page = ledger
            .entries_for_account(account_id, 2, 2)
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].previous_balance, 20);
        assert_eq!(page[1].previous_balance, 30);
    }
}
