//! API Middleware
//!
//! Authentication, rate limiting and request logging.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

use crate::domain::OperationContext;

use super::AppState;

/// Authenticated user extracted from the bearer token
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
}

// =========================================================================
// Bearer token authentication
// =========================================================================

/// Verify the Authorization header and attach the authenticated user and
/// operation context to the request.
pub async fn auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    let token = match headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        Some(token) => token,
        None => {
            return Err(unauthorized(
                "Missing or malformed Authorization header",
                "missing_token",
            ));
        }
    };

    let user_id = match state.auth().authenticate(token) {
        Ok(user_id) => user_id,
        Err(_) => return Err(unauthorized("Invalid or expired token", "invalid_token")),
    };

    // Tokens outlive account closure; reject deactivated users here.
    let is_active: Option<bool> =
        match sqlx::query_scalar("SELECT is_active FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&state.pool)
            .await
        {
            Ok(row) => row,
            Err(e) => {
                tracing::error!(error = %e, "user lookup failed during authentication");
                return Err(server_error("database_error"));
            }
        };

    if is_active != Some(true) {
        return Err(unauthorized("Unknown or deactivated user", "invalid_token"));
    }

    let mut context = OperationContext::for_user(user_id);
    if let Some(correlation_id) = headers
        .get("X-Correlation-Id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
    {
        context = context.with_correlation_id(correlation_id);
    }

    request.extensions_mut().insert(AuthUser { user_id });
    request.extensions_mut().insert(context);

    Ok(next.run(request).await)
}

// =========================================================================
// Rate limiting
// =========================================================================

/// Per-user fixed-window rate limiting backed by the rate_limit_buckets
/// table. Stale buckets are swept by the maintenance jobs.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    let user = match request.extensions().get::<AuthUser>() {
        Some(user) => user.clone(),
        None => {
            tracing::error!("rate limiter ran without an authenticated user");
            return Err(server_error("internal_error"));
        }
    };

    let count: i64 = match sqlx::query_scalar(
        r#"
        INSERT INTO rate_limit_buckets (subject_id, window_start, request_count)
        VALUES ($1, date_trunc('minute', NOW()), 1)
        ON CONFLICT (subject_id, window_start)
        DO UPDATE SET request_count = rate_limit_buckets.request_count + 1
        RETURNING request_count
        "#,
    )
    .bind(user.user_id)
    .fetch_one(&state.pool)
    .await
    {
        Ok(count) => count,
        Err(e) => {
            tracing::error!(error = %e, "rate limit bucket update failed");
            return Err(server_error("database_error"));
        }
    };

    if count > state.config.rate_limit_per_minute {
        return Err((
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "Rate limit exceeded",
                "errorCode": "rate_limit_exceeded"
            })),
        )
            .into_response());
    }

    Ok(next.run(request).await)
}

// =========================================================================
// Request logging
// =========================================================================

/// Headers that should be masked in logs
const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie", "set-cookie"];

/// Render headers for logging with credential-bearing values masked.
pub fn mask_headers_for_logging(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let rendered = if SENSITIVE_HEADERS.contains(&name.as_str().to_lowercase().as_str()) {
                "[REDACTED]"
            } else {
                value.to_str().unwrap_or("[invalid utf8]")
            };
            (name.to_string(), rendered.to_string())
        })
        .collect()
}

/// One structured log line per request, emitted at completion.
pub async fn logging_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let headers = mask_headers_for_logging(request.headers());

    let started = std::time::Instant::now();
    let response = next.run(request).await;

    tracing::info!(
        method = %method,
        uri = %uri,
        status = %response.status(),
        elapsed_ms = %started.elapsed().as_millis(),
        headers = ?headers,
        "request handled"
    );

    response
}

// =========================================================================
// Response helpers
// =========================================================================

fn unauthorized(message: &str, code: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": message, "errorCode": code })),
    )
        .into_response()
}

fn server_error(code: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Internal server error", "errorCode": code })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_headers_for_logging() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.insert("authorization", "Bearer secret-token".parse().unwrap());
        headers.insert("x-correlation-id", "abc-123".parse().unwrap());

        let masked = mask_headers_for_logging(&headers);

        let lookup = |name: &str| {
            masked
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        };

        assert_eq!(lookup("authorization"), Some("[REDACTED]"));
        assert_eq!(lookup("content-type"), Some("application/json"));
        assert_eq!(lookup("x-correlation-id"), Some("abc-123"));
    }

    #[test]
    fn test_sensitive_headers_list() {
        assert!(SENSITIVE_HEADERS.contains(&"authorization"));
        assert!(!SENSITIVE_HEADERS.contains(&"content-type"));
    }
}
