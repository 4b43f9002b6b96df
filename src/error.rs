//! Error handling module
//!
//! Central error type and its HTTP rendering. The mapping lets clients
//! tell retryable failures (contention, in-flight idempotency key) from
//! permanent ones (insufficient funds, unknown account, invalid request)
//! by status code and error code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::auth::AuthError;
use crate::domain::AmountError;
use crate::engine::EngineError;

/// Application-wide Result type
pub type AppResult<T> = Result<T, AppError>;

/// Application error types
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // Client errors (4xx)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: i64, available: i64 },

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Too many concurrent updates on account {0}")]
    Contention(String),

    #[error("Idempotency conflict: key is in flight or bound to a different request")]
    IdempotencyConflict,

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Missing or malformed Authorization header")]
    MissingToken,

    #[error("Email already registered")]
    EmailTaken,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    // Server errors (5xx)
    #[error("Transfer failed (source restored: {compensated}): {detail}")]
    TransferFailed { compensated: bool, detail: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status this error renders as.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
            AppError::AccountNotFound(_) | AppError::UserNotFound(_) => StatusCode::NOT_FOUND,
            AppError::Contention(_)
            | AppError::IdempotencyConflict
            | AppError::EmailTaken => StatusCode::CONFLICT,
            AppError::InvalidCredentials | AppError::MissingToken => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            AppError::TransferFailed { .. }
            | AppError::Database(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for API clients.
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::InsufficientFunds { .. } => "insufficient_funds",
            AppError::AccountNotFound(_) => "account_not_found",
            AppError::UserNotFound(_) => "user_not_found",
            AppError::Contention(_) => "contention",
            AppError::IdempotencyConflict => "idempotency_conflict",
            AppError::InvalidCredentials => "invalid_credentials",
            AppError::MissingToken => "missing_token",
            AppError::EmailTaken => "email_taken",
            AppError::Forbidden(_) => "forbidden",
            AppError::RateLimitExceeded => "rate_limit_exceeded",
            AppError::TransferFailed { .. } => "transfer_failed",
            AppError::Database(_) => "database_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    fn details(&self) -> Option<String> {
        match self {
            AppError::InvalidRequest(msg) | AppError::Forbidden(msg) => Some(msg.clone()),
            AppError::AccountNotFound(id) | AppError::UserNotFound(id) => Some(id.clone()),
            AppError::Contention(id) => Some(id.clone()),
            AppError::InsufficientFunds {
                required,
                available,
            } => Some(format!("required {}, available {}", required, available)),
            AppError::TransferFailed {
                compensated,
                detail,
            } => Some(format!("source restored: {}; {}", compensated, detail)),
            _ => None,
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(error = %self, code = self.error_code(), "request failed");
        }

        let body = ErrorResponse {
            error: self.to_string(),
            error_code: self.error_code().to_string(),
            details: self.details(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InvalidRequest(msg) => AppError::InvalidRequest(msg),
            EngineError::NotFound(id) => AppError::AccountNotFound(id),
            EngineError::InsufficientFunds {
                required,
                available,
            } => AppError::InsufficientFunds {
                required,
                available,
            },
            EngineError::Contention(id) => AppError::Contention(id.to_string()),
            EngineError::IdempotencyInFlight => AppError::IdempotencyConflict,
            EngineError::Idempotency(crate::idempotency::IdempotencyError::HashMismatch(_)) => {
                AppError::IdempotencyConflict
            }
            EngineError::TransferFailed {
                compensated,
                detail,
            } => AppError::TransferFailed {
                compensated,
                detail,
            },
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials | AuthError::Token(_) => AppError::InvalidCredentials,
            AuthError::InvalidRegistration(msg) => AppError::InvalidRequest(msg),
            AuthError::EmailTaken => AppError::EmailTaken,
            AuthError::UserNotFound(id) => AppError::UserNotFound(id),
            AuthError::Database(e) => AppError::Database(e),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<crate::account_store::StoreError> for AppError {
    fn from(err: crate::account_store::StoreError) -> Self {
        use crate::account_store::StoreError;
        match err {
            StoreError::NotFound(id) => AppError::AccountNotFound(id),
            StoreError::Database(e) => AppError::Database(e),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<crate::ledger::LedgerError> for AppError {
    fn from(err: crate::ledger::LedgerError) -> Self {
        use crate::ledger::LedgerError;
        match err {
            LedgerError::Database(e) => AppError::Database(e),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<AmountError> for AppError {
    fn from(err: AmountError) -> Self {
        AppError::InvalidRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_the_taxonomy() {
        let insufficient = AppError::InsufficientFunds {
            required: 200,
            available: 100,
        };
        assert_eq!(insufficient.status_code(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(insufficient.error_code(), "insufficient_funds");

        assert_eq!(
            AppError::Contention("a".to_string()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::InvalidRequest("x".to_string()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            AppError::AccountNotFound("a".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_engine_error_mapping() {
        let err: AppError = EngineError::InsufficientFunds {
            required: 200,
            available: 100,
        }
        .into();
        assert!(matches!(
            err,
            AppError::InsufficientFunds {
                required: 200,
                available: 100
            }
        ));

        let err: AppError = EngineError::IdempotencyInFlight.into();
        assert!(matches!(err, AppError::IdempotencyConflict));
    }

    #[test]
    fn test_auth_error_mapping() {
        let err: AppError = AuthError::InvalidCredentials.into();
        assert!(matches!(err, AppError::InvalidCredentials));

        let err: AppError = AuthError::EmailTaken.into();
        assert!(matches!(err, AppError::EmailTaken));
    }
}
