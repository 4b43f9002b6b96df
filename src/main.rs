//! corebank - Banking Backend API
//!
//! A small banking REST backend: registration/login, deposits, withdrawals
//! and peer-to-peer transfers over an append-only ledger. Balance mutations
//! go through per-account compare-and-swap with compensation, never through
//! cross-account transactions.

use std::net::SocketAddr;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use corebank::api::{self, AppState};
use corebank::jobs::{spawn_scheduler, DEFAULT_SWEEP_INTERVAL};
use corebank::Config;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "corebank=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn connect(config: &Config) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;

    corebank::db::verify_connection(&pool).await?;
    if !corebank::db::check_schema(&pool).await? {
        anyhow::bail!("database schema incomplete, run the migrations first");
    }

    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env()?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    tracing::info!(environment = %config.environment, "corebank starting");

    let pool = connect(&config).await?;
    tracing::info!("database ready");

    let scheduler = spawn_scheduler(pool.clone(), DEFAULT_SWEEP_INTERVAL);

    let app = api::build_router(AppState::new(pool.clone(), config));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down");
    scheduler.abort();
    pool.close().await;

    Ok(())
}

/// Resolve when the process receives ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("ctrl-c received, draining connections"),
        _ = terminate => tracing::info!("SIGTERM received, draining connections"),
    }
}
