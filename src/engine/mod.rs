//! Transfer Engine
//!
//! Orchestrates multi-account balance mutations as all-or-nothing units on
//! top of the account store's per-record compare-and-swap. The two legs of
//! a transfer are not wrapped in a cross-account transaction: the debit is
//! applied and recorded first, then the credit; if the credit leg cannot
//! complete, the engine credits the source back and appends a compensating
//! ledger entry. A debit is never left unmatched by either a credit or a
//! compensation, and a credit is never observable before its debit.
//!
//! Single-account deposits and withdrawals run through the same machinery.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::account_store::{Account, AccountStore, StoreError};
use crate::domain::Amount;
use crate::idempotency::{
    compute_request_hash, IdempotencyError, IdempotencyGuard, Reservation,
};
use crate::ledger::{EntryKind, Ledger, LedgerError, NewLedgerEntry};

/// Bound on CAS retries per account before failing with `Contention`.
const DEFAULT_MAX_RETRIES: u32 = 5;

/// Base backoff between CAS retries; attempt n waits n times this.
const RETRY_BACKOFF_MS: u64 = 10;

/// A request to move funds between two accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub source_account: Uuid,
    pub destination_account: Uuid,
    pub amount: Amount,
    pub idempotency_key: Uuid,
}

/// Result of a completed transfer. Cached verbatim under the idempotency
/// key, so a replayed request returns the identical value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub operation_id: Uuid,
    pub source_account: Uuid,
    pub destination_account: Uuid,
    pub amount: i64,
    /// Debit entry id followed by credit entry id
    pub ledger_entry_ids: Vec<Uuid>,
}

/// Result of a completed deposit or withdrawal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub operation_id: Uuid,
    pub account_id: Uuid,
    pub kind: EntryKind,
    pub amount: i64,
    pub new_balance: i64,
    pub ledger_entry_id: Uuid,
}

/// Engine errors. Retryable and non-retryable failures stay distinguishable.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed request (self-transfer; bad amounts are unrepresentable)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown or deactivated account
    #[error("Account not found: {0}")]
    NotFound(String),

    /// Business rule violation; retrying will not help
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: i64, available: i64 },

    /// CAS retries exhausted; safe to retry with the same idempotency key
    #[error("Contention on account {0}: too many concurrent updates")]
    Contention(Uuid),

    /// Same idempotency key is currently being executed
    #[error("Operation with this idempotency key is already in flight")]
    IdempotencyInFlight,

    /// The debit leg succeeded but the transfer could not complete.
    /// `compensated` reports whether the source balance was restored;
    /// an uncompensated failure requires operator attention.
    #[error("Transfer failed after debit (source restored: {compensated}): {detail}")]
    TransferFailed { compensated: bool, detail: String },

    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::InsufficientFunds { delta, balance, .. } => {
                EngineError::InsufficientFunds {
                    required: -delta,
                    available: balance,
                }
            }
            // Conflicts are handled by the retry loop; one escaping here
            // means the loop gave up.
            StoreError::VersionConflict { account_id, .. } => EngineError::Contention(account_id),
            other => EngineError::Store(other),
        }
    }
}

impl EngineError {
    /// Whether a client may resubmit the same request with the same key.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Contention(_) | EngineError::IdempotencyInFlight
        )
    }
}

/// The engine over pluggable store, ledger and guard backends.
#[derive(Debug, Clone)]
pub struct TransferEngine<S, L, G> {
    store: S,
    ledger: L,
    guard: G,
    max_retries: u32,
}

impl<S, L, G> TransferEngine<S, L, G>
where
    S: AccountStore,
    L: Ledger,
    G: IdempotencyGuard,
{
    pub fn new(store: S, ledger: L, guard: G) -> Self {
        Self {
            store,
            ledger,
            guard,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Execute a peer-to-peer transfer.
    ///
    /// A replay with the same idempotency key after completion returns the
    /// cached outcome without touching any balance.
    pub async fn execute(&self, request: TransferRequest) -> Result<TransferOutcome, EngineError> {
        if request.source_account == request.destination_account {
            return Err(EngineError::InvalidRequest(
                "cannot transfer to the same account".to_string(),
            ));
        }

        // Both accounts must be known before any mutation or reservation.
        self.store.get(request.source_account).await?;
        self.store.get(request.destination_account).await?;

        let request_hash = compute_request_hash(&serde_json::to_vec(&request)?);
        match self
            .guard
            .check_or_reserve(request.idempotency_key, &request_hash)
            .await?
        {
            Reservation::Completed(result) => {
                tracing::debug!(
                    idempotency_key = %request.idempotency_key,
                    "returning cached transfer outcome"
                );
                return Ok(serde_json::from_value(result)?);
            }
            Reservation::InFlight => return Err(EngineError::IdempotencyInFlight),
            Reservation::Fresh => {}
        }

        let operation_id = Uuid::new_v4();
        let result = self.run_transfer(&request, operation_id).await;

        match result {
            Ok(outcome) => {
                self.guard
                    .complete(request.idempotency_key, &serde_json::to_value(&outcome)?)
                    .await?;
                Ok(outcome)
            }
            Err(err) => {
                // Release the key so the client may retry with it.
                if let Err(guard_err) = self.guard.fail(request.idempotency_key).await {
                    tracing::error!(
                        idempotency_key = %request.idempotency_key,
                        error = %guard_err,
                        "failed to release idempotency key"
                    );
                }
                Err(err)
            }
        }
    }

    /// Debit source, record it, credit destination, record it. Any failure
    /// after the debit committed runs to compensation, never cancellation.
    async fn run_transfer(
        &self,
        request: &TransferRequest,
        operation_id: Uuid,
    ) -> Result<TransferOutcome, EngineError> {
        let amount = request.amount.minor_units();

        // Debit leg; InsufficientFunds and Contention surface directly
        // since nothing has been applied yet.
        let debited = self
            .apply_with_retry(request.source_account, -amount)
            .await?;

        let debit_entry_id = match self
            .ledger
            .append(leg_entry(&debited, operation_id, EntryKind::TransferDebit, -amount))
            .await
        {
            Ok(id) => id,
            Err(e) => {
                // The debit never reached the ledger, so the reversal is
                // not ledgered either.
                return Err(self
                    .compensate_source(
                        request.source_account,
                        operation_id,
                        amount,
                        false,
                        format!("debit ledger append failed: {}", e),
                    )
                    .await);
            }
        };

        // Credit leg; cannot fail on insufficiency, but the destination may
        // have been deactivated mid-flight or stay contended.
        let credited = match self
            .apply_with_retry(request.destination_account, amount)
            .await
        {
            Ok(account) => account,
            Err(e) => {
                return Err(self
                    .compensate_source(
                        request.source_account,
                        operation_id,
                        amount,
                        true,
                        format!("credit leg failed: {}", e),
                    )
                    .await);
            }
        };

        let credit_entry_id = match self
            .ledger
            .append(leg_entry(&credited, operation_id, EntryKind::TransferCredit, amount))
            .await
        {
            Ok(id) => id,
            Err(e) => {
                // Unwind the credit before restoring the source; the credit
                // was never observable in the ledger.
                if let Err(unwind_err) = self
                    .apply_with_retry(request.destination_account, -amount)
                    .await
                {
                    tracing::error!(
                        account_id = %request.destination_account,
                        error = %unwind_err,
                        "failed to unwind credit; destination retains unrecorded funds"
                    );
                }
                return Err(self
                    .compensate_source(
                        request.source_account,
                        operation_id,
                        amount,
                        true,
                        format!("credit ledger append failed: {}", e),
                    )
                    .await);
            }
        };

        tracing::info!(
            %operation_id,
            source = %request.source_account,
            destination = %request.destination_account,
            amount,
            "transfer completed"
        );

        Ok(TransferOutcome {
            operation_id,
            source_account: request.source_account,
            destination_account: request.destination_account,
            amount,
            ledger_entry_ids: vec![debit_entry_id, credit_entry_id],
        })
    }

    /// Deposit funds into an account.
    pub async fn deposit(
        &self,
        account_id: Uuid,
        amount: Amount,
        idempotency_key: Option<Uuid>,
    ) -> Result<OperationOutcome, EngineError> {
        self.single_leg(account_id, amount, EntryKind::Deposit, idempotency_key)
            .await
    }

    /// Withdraw funds from an account. An amount exceeding the balance
    /// fails with `InsufficientFunds` and writes no ledger entry.
    pub async fn withdraw(
        &self,
        account_id: Uuid,
        amount: Amount,
        idempotency_key: Option<Uuid>,
    ) -> Result<OperationOutcome, EngineError> {
        self.single_leg(account_id, amount, EntryKind::Withdrawal, idempotency_key)
            .await
    }

    async fn single_leg(
        &self,
        account_id: Uuid,
        amount: Amount,
        kind: EntryKind,
        idempotency_key: Option<Uuid>,
    ) -> Result<OperationOutcome, EngineError> {
        if let Some(key) = idempotency_key {
            let body = serde_json::json!({
                "accountId": account_id,
                "kind": kind,
                "amountMinorUnits": amount.minor_units(),
            });
            match self
                .guard
                .check_or_reserve(key, &compute_request_hash(&serde_json::to_vec(&body)?))
                .await?
            {
                Reservation::Completed(result) => return Ok(serde_json::from_value(result)?),
                Reservation::InFlight => return Err(EngineError::IdempotencyInFlight),
                Reservation::Fresh => {}
            }
        }

        let result = self.run_single_leg(account_id, amount, kind).await;

        if let Some(key) = idempotency_key {
            match &result {
                Ok(outcome) => {
                    self.guard
                        .complete(key, &serde_json::to_value(outcome)?)
                        .await?;
                }
                Err(_) => {
                    if let Err(guard_err) = self.guard.fail(key).await {
                        tracing::error!(
                            idempotency_key = %key,
                            error = %guard_err,
                            "failed to release idempotency key"
                        );
                    }
                }
            }
        }

        result
    }

    async fn run_single_leg(
        &self,
        account_id: Uuid,
        amount: Amount,
        kind: EntryKind,
    ) -> Result<OperationOutcome, EngineError> {
        let operation_id = Uuid::new_v4();
        let delta = match kind {
            EntryKind::Deposit => amount.minor_units(),
            EntryKind::Withdrawal => -amount.minor_units(),
            other => {
                return Err(EngineError::InvalidRequest(format!(
                    "{} is not a single-account operation",
                    other
                )))
            }
        };

        let updated = self.apply_with_retry(account_id, delta).await?;

        let ledger_entry_id = match self
            .ledger
            .append(leg_entry(&updated, operation_id, kind, delta))
            .await
        {
            Ok(id) => id,
            Err(e) => {
                // Keep balances and ledger in step: undo the unrecorded
                // balance change before surfacing the failure.
                if let Err(unwind_err) = self.apply_with_retry(account_id, -delta).await {
                    tracing::error!(
                        %account_id,
                        error = %unwind_err,
                        "failed to unwind {} after ledger append failure",
                        kind
                    );
                }
                return Err(e.into());
            }
        };

        tracing::info!(%operation_id, %account_id, %kind, amount = amount.minor_units(), "operation completed");

        Ok(OperationOutcome {
            operation_id,
            account_id,
            kind,
            amount: amount.minor_units(),
            new_balance: updated.balance.minor_units(),
            ledger_entry_id,
        })
    }

    /// Read-modify-CAS loop: re-read on version conflict, up to the retry
    /// bound, with a small bounded backoff.
    async fn apply_with_retry(&self, account_id: Uuid, delta: i64) -> Result<Account, EngineError> {
        for attempt in 0..self.max_retries {
            let account = self.store.get(account_id).await?;

            match self
                .store
                .conditional_update(account_id, account.version, delta)
                .await
            {
                Ok(updated) => return Ok(updated),
                Err(StoreError::VersionConflict { .. }) if attempt < self.max_retries - 1 => {
                    let backoff = Duration::from_millis(RETRY_BACKOFF_MS * (attempt as u64 + 1));
                    tracing::warn!(
                        %account_id,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        "version conflict, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(StoreError::VersionConflict { .. }) => {
                    return Err(EngineError::Contention(account_id));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::Contention(account_id))
    }

    /// Credit the source back after a failed transfer and, when the debit
    /// leg was ledgered, append the matching compensation entry.
    async fn compensate_source(
        &self,
        source_id: Uuid,
        operation_id: Uuid,
        amount: i64,
        ledgered: bool,
        detail: String,
    ) -> EngineError {
        match self.apply_with_retry(source_id, amount).await {
            Ok(restored) => {
                if ledgered {
                    let entry = leg_entry(&restored, operation_id, EntryKind::Compensation, amount);
                    if let Err(e) = self.ledger.append(entry).await {
                        tracing::error!(
                            %operation_id,
                            account_id = %source_id,
                            error = %e,
                            "compensation applied but ledger append failed"
                        );
                    }
                }
                tracing::warn!(
                    %operation_id,
                    account_id = %source_id,
                    amount,
                    detail = %detail,
                    "transfer compensated, source restored"
                );
                EngineError::TransferFailed {
                    compensated: true,
                    detail,
                }
            }
            Err(e) => {
                tracing::error!(
                    %operation_id,
                    account_id = %source_id,
                    amount,
                    error = %e,
                    "compensation failed, source not restored"
                );
                EngineError::TransferFailed {
                    compensated: false,
                    detail: format!("{}; compensation failed: {}", detail, e),
                }
            }
        }
    }
}

/// Engine over the Postgres backends, as wired by the HTTP layer.
pub type PgTransferEngine = TransferEngine<
    crate::account_store::PgAccountStore,
    crate::ledger::PgLedger,
    crate::idempotency::PgIdempotencyGuard,
>;

/// Build the ledger entry for one applied leg from the post-update account.
fn leg_entry(
    account: &Account,
    operation_id: Uuid,
    kind: EntryKind,
    delta: i64,
) -> NewLedgerEntry {
    let new_balance = account.balance.minor_units();
    NewLedgerEntry {
        account_id: account.id,
        operation_id,
        kind,
        delta,
        previous_balance: new_balance - delta,
        new_balance,
    }
}
