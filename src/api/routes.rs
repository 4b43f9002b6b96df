//! API Routes
//!
//! HTTP endpoint definitions. Wire format is camelCase JSON throughout;
//! amounts travel as integers in minor currency units.

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::account_store::{AccountStore, PgAccountStore};
use crate::auth::RegisterInput;
use crate::domain::Amount;
use crate::engine::TransferRequest;
use crate::error::AppError;
use crate::ledger::{EntryKind, Ledger, LedgerEntry, PgLedger};

use super::middleware::AuthUser;
use super::AppState;

// =========================================================================
// Request/Response types
// =========================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub token: String,
    pub user_id: Uuid,
    pub account_id: Uuid,
    pub account_number: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferApiRequest {
    pub source_account: Uuid,
    pub destination_account: Uuid,
    pub amount_minor_units: i64,
    pub idempotency_key: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferApiResponse {
    pub status: String,
    pub operation_id: Uuid,
    pub ledger_entry_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountResponse {
    pub account_id: Uuid,
    pub account_number: String,
    pub balance_minor_units: i64,
    pub version: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceChangeRequest {
    pub account_id: Uuid,
    pub amount_minor_units: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceChangeResponse {
    pub status: String,
    pub operation_id: Uuid,
    pub ledger_entry_id: Uuid,
    pub new_balance_minor_units: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyAccountRequest {
    pub account_number: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyAccountResponse {
    pub account_id: Uuid,
    pub account_number: String,
    pub account_holder: String,
}

#[derive(Debug, Deserialize)]
pub struct LedgerQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntryResponse {
    pub id: Uuid,
    pub operation_id: Uuid,
    pub kind: EntryKind,
    pub delta_minor_units: i64,
    pub previous_balance_minor_units: i64,
    pub new_balance_minor_units: i64,
    pub created_at: DateTime<Utc>,
}

impl From<LedgerEntry> for LedgerEntryResponse {
    fn from(entry: LedgerEntry) -> Self {
        Self {
            id: entry.id,
            operation_id: entry.operation_id,
            kind: entry.kind,
            delta_minor_units: entry.delta,
            previous_balance_minor_units: entry.previous_balance,
            new_balance_minor_units: entry.new_balance,
            created_at: entry.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerResponse {
    pub account_id: Uuid,
    pub entries: Vec<LedgerEntryResponse>,
    pub total: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileResponse {
    pub user_id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub account_id: Uuid,
    pub account_number: String,
    pub balance_minor_units: i64,
    pub created_at: DateTime<Utc>,
}

// =========================================================================
// Routers
// =========================================================================

/// Public authentication routes
pub fn auth_router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/logout", post(logout))
}

/// Protected API routes
pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/transfers", post(create_transfer))
        .route("/accounts/:account_id", get(get_account))
        .route("/accounts/deposit", post(deposit))
        .route("/accounts/withdraw", post(withdraw))
        .route("/accounts/verify", post(verify_account))
        .route("/ledger/:account_id", get(get_ledger))
        .route("/users/me", get(me))
}

// =========================================================================
// POST /auth/register
// =========================================================================

/// Register a new user and their wallet account
async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResponse>), AppError> {
    let outcome = state
        .auth()
        .register(RegisterInput {
            first_name: request.first_name,
            last_name: request.last_name,
            email: request.email,
            password: request.password,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            token: outcome.token,
            user_id: outcome.user_id,
            account_id: outcome.account_id,
            account_number: outcome.account_number,
        }),
    ))
}

// =========================================================================
// POST /auth/login
// =========================================================================

/// Verify credentials and issue a session token
async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, AppError> {
    let outcome = state.auth().login(&request.email, &request.password).await?;

    Ok(Json(AuthResponse {
        token: outcome.token,
        user_id: outcome.user_id,
        account_id: outcome.account_id,
        account_number: outcome.account_number,
    }))
}

// =========================================================================
// POST /auth/logout
// =========================================================================

/// Sessions are stateless; the token is discarded client-side
async fn logout() -> Json<MessageResponse> {
    Json(MessageResponse {
        message: "Logged out".to_string(),
    })
}

// =========================================================================
// POST /api/v1/transfers
// =========================================================================

/// Transfer funds between two accounts
async fn create_transfer(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Extension(context): Extension<crate::domain::OperationContext>,
    Json(request): Json<TransferApiRequest>,
) -> Result<(StatusCode, Json<TransferApiResponse>), AppError> {
    let amount = Amount::new(request.amount_minor_units)?;

    let source = require_owned_account(&state, request.source_account, &user).await?;

    tracing::info!(
        correlation_id = %context.correlation_id,
        source = %source.id,
        destination = %request.destination_account,
        amount = request.amount_minor_units,
        "transfer requested"
    );

    let outcome = state
        .engine()
        .execute(TransferRequest {
            source_account: source.id,
            destination_account: request.destination_account,
            amount,
            idempotency_key: request.idempotency_key,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(TransferApiResponse {
            status: "completed".to_string(),
            operation_id: outcome.operation_id,
            ledger_entry_ids: outcome.ledger_entry_ids,
        }),
    ))
}

// =========================================================================
// GET /api/v1/accounts/:account_id
// =========================================================================

/// Current balance and version of an account
async fn get_account(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(account_id): Path<Uuid>,
) -> Result<Json<AccountResponse>, AppError> {
    let account = require_owned_account(&state, account_id, &user).await?;

    Ok(Json(AccountResponse {
        account_id: account.id,
        account_number: account.account_number,
        balance_minor_units: account.balance.minor_units(),
        version: account.version,
    }))
}

// =========================================================================
// POST /api/v1/accounts/deposit
// =========================================================================

/// Deposit funds into the caller's account
async fn deposit(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    headers: axum::http::HeaderMap,
    Json(request): Json<BalanceChangeRequest>,
) -> Result<(StatusCode, Json<BalanceChangeResponse>), AppError> {
    let amount = Amount::new(request.amount_minor_units)?;
    let account = require_owned_account(&state, request.account_id, &user).await?;

    let outcome = state
        .engine()
        .deposit(account.id, amount, idempotency_key(&headers))
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(BalanceChangeResponse {
            status: "completed".to_string(),
            operation_id: outcome.operation_id,
            ledger_entry_id: outcome.ledger_entry_id,
            new_balance_minor_units: outcome.new_balance,
        }),
    ))
}

// =========================================================================
// POST /api/v1/accounts/withdraw
// =========================================================================

/// Withdraw funds from the caller's account
async fn withdraw(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    headers: axum::http::HeaderMap,
    Json(request): Json<BalanceChangeRequest>,
) -> Result<(StatusCode, Json<BalanceChangeResponse>), AppError> {
    let amount = Amount::new(request.amount_minor_units)?;
    let account = require_owned_account(&state, request.account_id, &user).await?;

    let outcome = state
        .engine()
        .withdraw(account.id, amount, idempotency_key(&headers))
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(BalanceChangeResponse {
            status: "completed".to_string(),
            operation_id: outcome.operation_id,
            ledger_entry_id: outcome.ledger_entry_id,
            new_balance_minor_units: outcome.new_balance,
        }),
    ))
}

// =========================================================================
// POST /api/v1/accounts/verify
// =========================================================================

/// Look up the holder of an account number before transferring to it
async fn verify_account(
    State(state): State<AppState>,
    Json(request): Json<VerifyAccountRequest>,
) -> Result<Json<VerifyAccountResponse>, AppError> {
    let account = PgAccountStore::new(state.pool.clone())
        .get_by_number(&request.account_number)
        .await?;

    let holder: Option<(String, String)> =
        sqlx::query_as("SELECT first_name, last_name FROM users WHERE id = $1")
            .bind(account.owner_id)
            .fetch_optional(&state.pool)
            .await?;

    let (first_name, last_name) =
        holder.ok_or_else(|| AppError::UserNotFound(account.owner_id.to_string()))?;

    Ok(Json(VerifyAccountResponse {
        account_id: account.id,
        account_number: account.account_number,
        account_holder: format!("{} {}", first_name, last_name),
    }))
}

// =========================================================================
// GET /api/v1/ledger/:account_id
// =========================================================================

/// Paginated, ordered ledger entries for an account
async fn get_ledger(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(account_id): Path<Uuid>,
    Query(query): Query<LedgerQuery>,
) -> Result<Json<LedgerResponse>, AppError> {
    let account = require_owned_account(&state, account_id, &user).await?;

    let limit = query.limit.clamp(1, 1000);
    let offset = query.offset.max(0);

    let ledger = PgLedger::new(state.pool.clone());
    let entries = ledger
        .entries_for_account(account.id, limit, offset)
        .await?;
    let total = ledger.count_for_account(account.id).await?;

    Ok(Json(LedgerResponse {
        account_id: account.id,
        entries: entries.into_iter().map(LedgerEntryResponse::from).collect(),
        total,
    }))
}

// =========================================================================
// GET /api/v1/users/me
// =========================================================================

/// Authenticated user's profile and account summary
async fn me(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<ProfileResponse>, AppError> {
    let profile = state.auth().profile(user.user_id).await?;

    Ok(Json(ProfileResponse {
        user_id: profile.user_id,
        first_name: profile.first_name,
        last_name: profile.last_name,
        email: profile.email,
        account_id: profile.account_id,
        account_number: profile.account_number,
        balance_minor_units: profile.balance,
        created_at: profile.created_at,
    }))
}

// =========================================================================
// Helpers
// =========================================================================

/// Fetch an account and require the authenticated user to own it.
async fn require_owned_account(
    state: &AppState,
    account_id: Uuid,
    user: &AuthUser,
) -> Result<crate::account_store::Account, AppError> {
    let account = PgAccountStore::new(state.pool.clone())
        .get(account_id)
        .await?;

    if account.owner_id != user.user_id {
        return Err(AppError::Forbidden(
            "account does not belong to the authenticated user".to_string(),
        ));
    }

    Ok(account)
}

/// Optional Idempotency-Key header for deposits and withdrawals.
fn idempotency_key(headers: &axum::http::HeaderMap) -> Option<Uuid> {
    headers
        .get("Idempotency-Key")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_request_deserialize() {
        let json = r#"{
            "sourceAccount": "550e8400-e29b-41d4-a716-446655440001",
            "destinationAccount": "550e8400-e29b-41d4-a716-446655440002",
            "amountMinorUnits": 20000,
            "idempotencyKey": "550e8400-e29b-41d4-a716-446655440003"
        }"#;

        let request: TransferApiRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.amount_minor_units, 20000);
    }

    #[test]
    fn test_register_request_deserialize() {
        let json = r#"{
            "firstName": "Ada",
            "lastName": "Lovelace",
            "email": "ada@example.com",
            "password": "longenough"
        }"#;

        let request: RegisterRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.first_name, "Ada");
        assert_eq!(request.email, "ada@example.com");
    }

    #[test]
    fn test_ledger_query_defaults() {
        let query: LedgerQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(query.limit, 50);
        assert_eq!(query.offset, 0);
    }

    #[test]
    fn test_transfer_response_serializes_camel_case() {
        let response = TransferApiResponse {
            status: "completed".to_string(),
            operation_id: Uuid::nil(),
            ledger_entry_ids: vec![Uuid::nil()],
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("ledgerEntryIds"));
        assert!(json.contains("operationId"));
    }
}
