//! Transfer engine property tests
//!
//! Run against the in-memory backends: conservation of funds, negative
//! balance exclusion, idempotent replay, concurrent opposing transfers and
//! the compensation path.

use uuid::Uuid;

use corebank::account_store::{AccountStore, MemoryAccountStore};
use corebank::domain::Amount;
use corebank::engine::{EngineError, TransferEngine, TransferRequest};
use corebank::idempotency::MemoryIdempotencyGuard;
use corebank::ledger::{EntryKind, Ledger, MemoryLedger};

mod common;

use common::{engine_with_accounts, seed_accounts, FailCreditStore};

fn transfer(source: Uuid, destination: Uuid, amount: i64) -> TransferRequest {
    TransferRequest {
        source_account: source,
        destination_account: destination,
        amount: Amount::new(amount).unwrap(),
        idempotency_key: Uuid::new_v4(),
    }
}

async fn balance_of<S: AccountStore>(store: &S, id: Uuid) -> i64 {
    store.get(id).await.unwrap().balance.minor_units()
}

// =========================================================================
// Conservation
// =========================================================================

#[tokio::test]
async fn transfers_conserve_total_balance() {
    let (engine, ids) = engine_with_accounts(&[500, 100, 250]).await;

    engine.execute(transfer(ids[0], ids[1], 200)).await.unwrap();
    engine.execute(transfer(ids[1], ids[2], 150)).await.unwrap();
    engine.execute(transfer(ids[2], ids[0], 400)).await.unwrap();

    let total = balance_of(engine.store(), ids[0]).await
        + balance_of(engine.store(), ids[1]).await
        + balance_of(engine.store(), ids[2]).await;

    assert_eq!(total, 850);
}

#[tokio::test]
async fn worked_example_x_500_y_100() {
    let (engine, ids) = engine_with_accounts(&[500, 100]).await;

    let outcome = engine.execute(transfer(ids[0], ids[1], 200)).await.unwrap();

    assert_eq!(balance_of(engine.store(), ids[0]).await, 300);
    assert_eq!(balance_of(engine.store(), ids[1]).await, 300);
    assert_eq!(outcome.ledger_entry_ids.len(), 2);

    let source_entries = engine
        .ledger()
        .entries_for_account(ids[0], 10, 0)
        .await
        .unwrap();
    let destination_entries = engine
        .ledger()
        .entries_for_account(ids[1], 10, 0)
        .await
        .unwrap();

    assert_eq!(source_entries.len(), 1);
    assert_eq!(source_entries[0].delta, -200);
    assert_eq!(destination_entries.len(), 1);
    assert_eq!(destination_entries[0].delta, 200);
}

// =========================================================================
// Idempotent replay
// =========================================================================

#[tokio::test]
async fn replay_returns_identical_result_without_second_mutation() {
    let (engine, ids) = engine_with_accounts(&[500, 100]).await;
    let request = transfer(ids[0], ids[1], 200);

    let first = engine.execute(request.clone()).await.unwrap();
    let second = engine.execute(request.clone()).await.unwrap();
    let third = engine.execute(request).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first, third);

    assert_eq!(balance_of(engine.store(), ids[0]).await, 300);
    assert_eq!(balance_of(engine.store(), ids[1]).await, 300);

    // Exactly one debit and one credit, no matter how often replayed
    assert_eq!(engine.ledger().count_for_account(ids[0]).await.unwrap(), 1);
    assert_eq!(engine.ledger().count_for_account(ids[1]).await.unwrap(), 1);
}

#[tokio::test]
async fn same_key_with_different_request_conflicts() {
    let (engine, ids) = engine_with_accounts(&[500, 100]).await;

    let mut request = transfer(ids[0], ids[1], 200);
    engine.execute(request.clone()).await.unwrap();

    // Same key, different amount
    request.amount = Amount::new(300).unwrap();
    let result = engine.execute(request).await;

    assert!(matches!(
        result,
        Err(EngineError::Idempotency(
            corebank::idempotency::IdempotencyError::HashMismatch(_)
        ))
    ));

    // Nothing moved on the conflicting attempt
    assert_eq!(balance_of(engine.store(), ids[0]).await, 300);
}

// =========================================================================
// Concurrency
// =========================================================================

#[tokio::test]
async fn concurrent_opposing_transfers_net_to_zero() {
    let (engine, ids) = engine_with_accounts(&[400, 400]).await;
    let engine = engine.with_max_retries(20);

    let a_to_b = {
        let engine = engine.clone();
        let request = transfer(ids[0], ids[1], 150);
        tokio::spawn(async move { engine.execute(request).await })
    };
    let b_to_a = {
        let engine = engine.clone();
        let request = transfer(ids[1], ids[0], 150);
        tokio::spawn(async move { engine.execute(request).await })
    };

    a_to_b.await.unwrap().unwrap();
    b_to_a.await.unwrap().unwrap();

    // Equal opposing amounts leave both balances unchanged
    assert_eq!(balance_of(engine.store(), ids[0]).await, 400);
    assert_eq!(balance_of(engine.store(), ids[1]).await, 400);

    // Four ledger entries: a debit and a credit on each account
    assert_eq!(engine.ledger().count_for_account(ids[0]).await.unwrap(), 2);
    assert_eq!(engine.ledger().count_for_account(ids[1]).await.unwrap(), 2);
}

#[tokio::test]
async fn no_balance_goes_negative_under_concurrent_operations() {
    let (engine, ids) = engine_with_accounts(&[100, 0]).await;
    let engine = engine.with_max_retries(30);
    let account = ids[0];
    let sink = ids[1];

    let mut handles = Vec::new();

    // More withdrawals than the balance can satisfy, racing deposits and
    // transfers on the same account.
    for i in 0..12 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            match i % 3 {
                0 => engine
                    .withdraw(account, Amount::new(30).unwrap(), None)
                    .await
                    .map(|o| ("withdraw", o.amount)),
                1 => engine
                    .deposit(account, Amount::new(20).unwrap(), None)
                    .await
                    .map(|o| ("deposit", o.amount)),
                _ => engine
                    .execute(transfer(account, sink, 30))
                    .await
                    .map(|o| ("transfer", o.amount)),
            }
        }));
    }

    let mut withdrawn = 0;
    let mut deposited = 0;
    let mut transferred = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(("withdraw", amount)) => withdrawn += amount,
            Ok(("deposit", amount)) => deposited += amount,
            Ok(("transfer", amount)) => transferred += amount,
            Ok(_) => unreachable!(),
            // Insufficient funds and contention are legal outcomes here;
            // the invariant under test is that balances never go negative.
            Err(
                EngineError::InsufficientFunds { .. }
                | EngineError::Contention(_)
                | EngineError::TransferFailed {
                    compensated: true,
                    ..
                },
            ) => {}
            Err(other) => panic!("unexpected engine error: {}", other),
        }
    }

    let balance = balance_of(engine.store(), account).await;
    let sink_balance = balance_of(engine.store(), sink).await;

    assert!(balance >= 0);
    assert!(sink_balance >= 0);
    assert_eq!(balance, 100 + deposited - withdrawn - transferred);
    assert_eq!(sink_balance, transferred);
}

// =========================================================================
// Compensation
// =========================================================================

#[tokio::test]
async fn failed_credit_leg_restores_source_with_compensation_entry() {
    let store = MemoryAccountStore::new();
    let ids = seed_accounts(&store, &[500, 100]).await;

    // Destination passes upfront validation but rejects the credit leg.
    let failing = FailCreditStore::new(store.clone(), ids[1]);
    let guard = MemoryIdempotencyGuard::new();
    let engine = TransferEngine::new(failing, MemoryLedger::new(), guard.clone());

    let request = transfer(ids[0], ids[1], 200);
    let key = request.idempotency_key;
    let result = engine.execute(request).await;

    match result {
        Err(EngineError::TransferFailed {
            compensated: true, ..
        }) => {}
        other => panic!("expected compensated TransferFailed, got {:?}", other),
    }

    // Source balance restored to its pre-transfer value
    assert_eq!(balance_of(&store, ids[0]).await, 500);
    assert_eq!(balance_of(&store, ids[1]).await, 100);

    // The debit is matched by a compensation entry; the destination never
    // saw a credit.
    let source_entries = engine
        .ledger()
        .entries_for_account(ids[0], 10, 0)
        .await
        .unwrap();
    assert_eq!(source_entries.len(), 2);
    assert_eq!(source_entries[0].kind, EntryKind::TransferDebit);
    assert_eq!(source_entries[0].delta, -200);
    assert_eq!(source_entries[1].kind, EntryKind::Compensation);
    assert_eq!(source_entries[1].delta, 200);
    assert_eq!(
        source_entries[0].operation_id,
        source_entries[1].operation_id
    );

    assert_eq!(engine.ledger().count_for_account(ids[1]).await.unwrap(), 0);

    // The key is released for a retry, not marked completed
    assert_eq!(
        guard.status_of(key),
        Some(corebank::idempotency::IdempotencyStatus::Failed)
    );
}

// =========================================================================
// Insufficient funds
// =========================================================================

#[tokio::test]
async fn over_balance_withdrawal_fails_without_ledger_entry() {
    let (engine, ids) = engine_with_accounts(&[100]).await;

    let result = engine
        .withdraw(ids[0], Amount::new(250).unwrap(), None)
        .await;

    assert!(matches!(
        result,
        Err(EngineError::InsufficientFunds {
            required: 250,
            available: 100
        })
    ));

    assert_eq!(balance_of(engine.store(), ids[0]).await, 100);
    assert_eq!(engine.ledger().count_for_account(ids[0]).await.unwrap(), 0);
}
