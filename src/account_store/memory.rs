//! In-memory account store
//!
//! Mutex-guarded map with the same conditional-update semantics as the
//! Postgres backend. Used by the engine tests and local development.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use uuid::Uuid;

use crate::domain::Balance;

use super::{Account, AccountStore, NewAccount, StoreError};

/// Account store holding all state in process memory.
///
/// The compare-and-swap runs under a single lock, which gives it the same
/// atomicity as the database backend's guarded UPDATE.
#[derive(Debug, Clone, Default)]
pub struct MemoryAccountStore {
    accounts: Arc<Mutex<HashMap<Uuid, Account>>>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AccountStore for MemoryAccountStore {
    async fn get(&self, id: Uuid) -> Result<Account, StoreError> {
        let accounts = self.accounts.lock().expect("account store lock poisoned");
        accounts
            .get(&id)
            .filter(|a| a.is_active)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn get_by_number(&self, account_number: &str) -> Result<Account, StoreError> {
        let accounts = self.accounts.lock().expect("account store lock poisoned");
        accounts
            .values()
            .find(|a| a.account_number == account_number && a.is_active)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(account_number.to_string()))
    }

    async fn create(&self, new_account: NewAccount) -> Result<Account, StoreError> {
        let mut accounts = self.accounts.lock().expect("account store lock poisoned");

        if accounts
            .values()
            .any(|a| a.account_number == new_account.account_number)
        {
            return Err(StoreError::DuplicateAccountNumber(
                new_account.account_number,
            ));
        }

        let account = Account {
            id: new_account.id,
            owner_id: new_account.owner_id,
            account_number: new_account.account_number,
            balance: Balance::zero(),
            version: 1,
            is_active: true,
            created_at: Utc::now(),
        };
        accounts.insert(account.id, account.clone());

        Ok(account)
    }

    async fn conditional_update(
        &self,
        id: Uuid,
        expected_version: i64,
        delta: i64,
    ) -> Result<Account, StoreError> {
        let mut accounts = self.accounts.lock().expect("account store lock poisoned");

        let account = accounts
            .get_mut(&id)
            .filter(|a| a.is_active)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if account.version != expected_version {
            return Err(StoreError::VersionConflict {
                account_id: id,
                expected: expected_version,
                actual: account.version,
            });
        }

        let new_balance = account.balance.minor_units() + delta;
        let new_balance = Balance::new(new_balance).map_err(|_| StoreError::InsufficientFunds {
            account_id: id,
            delta,
            balance: account.balance.minor_units(),
        })?;

        account.balance = new_balance;
        account.version += 1;

        Ok(account.clone())
    }

    async fn deactivate(&self, id: Uuid) -> Result<(), StoreError> {
        let mut accounts = self.accounts.lock().expect("account store lock poisoned");

        let account = accounts
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        account.is_active = false;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_account(number: &str) -> NewAccount {
        NewAccount {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            account_number: number.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemoryAccountStore::new();
        let created = store.create(new_account("1234567890")).await.unwrap();

        assert_eq!(created.balance, Balance::zero());
        assert_eq!(created.version, 1);

        let fetched = store.get(created.id).await.unwrap();
        assert_eq!(fetched, created);

        let by_number = store.get_by_number("1234567890").await.unwrap();
        assert_eq!(by_number.id, created.id);
    }

    #[tokio::test]
    async fn test_duplicate_account_number_rejected() {
        let store = MemoryAccountStore::new();
        store.create(new_account("1234567890")).await.unwrap();

        let result = store.create(new_account("1234567890")).await;
        assert!(matches!(
            result,
            Err(StoreError::DuplicateAccountNumber(_))
        ));
    }

    #[tokio::test]
    async fn test_conditional_update_applies_delta() {
        let store = MemoryAccountStore::new();
        let account = store.create(new_account("1234567890")).await.unwrap();

        let updated = store.conditional_update(account.id, 1, 500).await.unwrap();
        assert_eq!(updated.balance.minor_units(), 500);
        assert_eq!(updated.version, 2);

        let updated = store.conditional_update(account.id, 2, -200).await.unwrap();
        assert_eq!(updated.balance.minor_units(), 300);
        assert_eq!(updated.version, 3);
    }

    #[tokio::test]
    async fn test_conditional_update_version_conflict() {
        let store = MemoryAccountStore::new();
        let account = store.create(new_account("1234567890")).await.unwrap();

        let result = store.conditional_update(account.id, 99, 500).await;
        assert!(matches!(
            result,
            Err(StoreError::VersionConflict {
                expected: 99,
                actual: 1,
                ..
            })
        ));

        // No side effects on conflict
        let fetched = store.get(account.id).await.unwrap();
        assert_eq!(fetched.balance, Balance::zero());
        assert_eq!(fetched.version, 1);
    }

    #[tokio::test]
    async fn test_conditional_update_insufficient_funds() {
        let store = MemoryAccountStore::new();
        let account = store.create(new_account("1234567890")).await.unwrap();
        store.conditional_update(account.id, 1, 100).await.unwrap();

        let result = store.conditional_update(account.id, 2, -200).await;
        assert!(matches!(
            result,
            Err(StoreError::InsufficientFunds {
                delta: -200,
                balance: 100,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_deactivated_account_not_found() {
        let store = MemoryAccountStore::new();
        let account = store.create(new_account("1234567890")).await.unwrap();

        store.deactivate(account.id).await.unwrap();

        assert!(matches!(
            store.get(account.id).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.conditional_update(account.id, 1, 100).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
