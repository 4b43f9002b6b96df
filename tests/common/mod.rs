//! Common test utilities
//!
//! Engine fixtures over the in-memory backends, plus a fault-injecting
//! account store for driving the compensation path.

use uuid::Uuid;

use corebank::account_store::{
    Account, AccountStore, MemoryAccountStore, NewAccount, StoreError,
};
use corebank::engine::TransferEngine;
use corebank::idempotency::MemoryIdempotencyGuard;
use corebank::ledger::MemoryLedger;

pub type MemoryEngine = TransferEngine<MemoryAccountStore, MemoryLedger, MemoryIdempotencyGuard>;

/// Build an engine over fresh in-memory backends with one account per
/// requested balance. Returns the engine and the account ids in order.
pub async fn engine_with_accounts(balances: &[i64]) -> (MemoryEngine, Vec<Uuid>) {
    let store = MemoryAccountStore::new();
    let ids = seed_accounts(&store, balances).await;

    let engine = TransferEngine::new(store, MemoryLedger::new(), MemoryIdempotencyGuard::new());
    (engine, ids)
}

/// Create accounts with the given starting balances on an existing store.
pub async fn seed_accounts(store: &MemoryAccountStore, balances: &[i64]) -> Vec<Uuid> {
    let mut ids = Vec::new();

    for (i, balance) in balances.iter().enumerate() {
        let account = store
            .create(NewAccount {
                id: Uuid::new_v4(),
                owner_id: Uuid::new_v4(),
                account_number: format!("90000000{:02}", i),
            })
            .await
            .expect("account creation failed");

        if *balance > 0 {
            store
                .conditional_update(account.id, 1, *balance)
                .await
                .expect("seeding balance failed");
        }
        ids.push(account.id);
    }

    ids
}

/// Account store that refuses credits to one designated account, standing
/// in for a destination that disappears between validation and the credit
/// leg.
#[derive(Debug, Clone)]
pub struct FailCreditStore {
    inner: MemoryAccountStore,
    fail_account: Uuid,
}

impl FailCreditStore {
    pub fn new(inner: MemoryAccountStore, fail_account: Uuid) -> Self {
        Self {
            inner,
            fail_account,
        }
    }
}

impl AccountStore for FailCreditStore {
    async fn get(&self, id: Uuid) -> Result<Account, StoreError> {
        self.inner.get(id).await
    }

    async fn get_by_number(&self, account_number: &str) -> Result<Account, StoreError> {
        self.inner.get_by_number(account_number).await
    }

    async fn create(&self, new_account: NewAccount) -> Result<Account, StoreError> {
        self.inner.create(new_account).await
    }

    async fn conditional_update(
        &self,
        id: Uuid,
        expected_version: i64,
        delta: i64,
    ) -> Result<Account, StoreError> {
        if id == self.fail_account && delta > 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.inner.conditional_update(id, expected_version, delta).await
    }

    async fn deactivate(&self, id: Uuid) -> Result<(), StoreError> {
        self.inner.deactivate(id).await
    }
}
