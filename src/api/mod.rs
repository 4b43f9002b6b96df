//! API module
//!
//! HTTP surface: application state, router assembly and middleware wiring.

use std::sync::Arc;

use axum::{middleware as axum_middleware, Router};
use sqlx::PgPool;
use tower_http::trace::TraceLayer;

use crate::account_store::PgAccountStore;
use crate::auth::AuthService;
use crate::config::Config;
use crate::engine::{PgTransferEngine, TransferEngine};
use crate::idempotency::PgIdempotencyGuard;
use crate::ledger::PgLedger;

pub mod middleware;
pub mod routes;

/// Shared application state. Request handlers build their services from
/// this; there is no other process-wide mutable state.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        Self {
            pool,
            config: Arc::new(config),
        }
    }

    /// Transfer engine over the Postgres backends.
    pub fn engine(&self) -> PgTransferEngine {
        TransferEngine::new(
            PgAccountStore::new(self.pool.clone()),
            PgLedger::new(self.pool.clone()),
            PgIdempotencyGuard::new(
                self.pool.clone(),
                self.config.idempotency_retention_hours,
            ),
        )
        .with_max_retries(self.config.transfer_max_retries)
    }

    /// Authentication service.
    pub fn auth(&self) -> AuthService {
        AuthService::new(
            self.pool.clone(),
            self.config.jwt_secret.clone(),
            self.config.token_ttl_hours,
        )
    }
}

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    // Axum layers apply in reverse order (last added = first executed).
    // Order: logging -> auth -> rate_limit -> handler
    let protected_routes = routes::create_router()
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit_middleware,
        ))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .layer(axum_middleware::from_fn(middleware::logging_middleware));

    Router::new()
        // Health check (no auth)
        .route("/health", axum::routing::get(health_check))
        // Registration and login (no auth)
        .nest("/auth", routes::auth_router())
        // Protected API routes
        .nest("/api/v1", protected_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
