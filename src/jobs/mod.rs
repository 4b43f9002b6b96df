//! Scheduled Jobs
//!
//! Periodic maintenance that keeps bounded what the request path leaves
//! behind: idempotency keys past their retention window, reservations
//! orphaned by a crashed worker, and spent rate-limit windows.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;
use tokio::time::interval;

/// Maintenance over the idempotency and rate-limit tables.
#[derive(Debug, Clone)]
pub struct MaintenanceJobs {
    pool: PgPool,
}

impl MaintenanceJobs {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Drop idempotency keys whose retention window has passed. A dropped
    /// key makes the next submission with it execute fresh, which is the
    /// contract after expiry.
    pub async fn sweep_expired_keys(&self) -> Result<u64, JobError> {
        let swept = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await?
            .rows_affected();

        if swept > 0 {
            tracing::info!(swept, "expired idempotency keys removed");
        }

        Ok(swept)
    }

    /// Release reservations stuck in 'processing'. A worker that died after
    /// reserving leaves its key in flight forever; marking it failed lets
    /// the client retry.
    pub async fn release_stuck_reservations(&self) -> Result<u64, JobError> {
        let released = sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET status = 'failed'
            WHERE status = 'processing'
              AND processing_started_at < NOW() - INTERVAL '5 minutes'
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        if released > 0 {
            tracing::warn!(released, "stuck idempotency reservations released");
        }

        Ok(released)
    }

    /// Remove rate-limit windows that can no longer affect a decision.
    pub async fn sweep_rate_limit_buckets(&self) -> Result<u64, JobError> {
        let swept = sqlx::query(
            "DELETE FROM rate_limit_buckets WHERE window_start < NOW() - INTERVAL '2 minutes'",
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        if swept > 0 {
            tracing::info!(swept, "stale rate limit buckets removed");
        }

        Ok(swept)
    }

    /// Run every job once and collect what happened. Used by the scheduler
    /// tick and directly by tests and operators.
    pub async fn run_once(&self) -> SweepReport {
        let mut report = SweepReport {
            finished_at: Utc::now(),
            ..Default::default()
        };

        match self.sweep_expired_keys().await {
            Ok(n) => report.expired_keys = n,
            Err(e) => report.errors.push(format!("expired keys: {}", e)),
        }
        match self.release_stuck_reservations().await {
            Ok(n) => report.released_reservations = n,
            Err(e) => report.errors.push(format!("stuck reservations: {}", e)),
        }
        match self.sweep_rate_limit_buckets().await {
            Ok(n) => report.rate_limit_buckets = n,
            Err(e) => report.errors.push(format!("rate limit buckets: {}", e)),
        }

        report.finished_at = Utc::now();
        report
    }
}

/// What one maintenance pass changed.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub expired_keys: u64,
    pub released_reservations: u64,
    pub rate_limit_buckets: u64,
    pub errors: Vec<String>,
    pub finished_at: DateTime<Utc>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// How often the maintenance pass runs.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Spawn the maintenance loop. The returned handle aborts it.
pub fn spawn_scheduler(pool: PgPool, sweep_interval: Duration) -> tokio::task::JoinHandle<()> {
    let jobs = MaintenanceJobs::new(pool);

    tokio::spawn(async move {
        tracing::info!(interval_secs = sweep_interval.as_secs(), "maintenance scheduler started");
        let mut ticker = interval(sweep_interval);

        loop {
            ticker.tick().await;
            let report = jobs.run_once().await;
            if !report.is_clean() {
                for error in &report.errors {
                    tracing::error!(error = %error, "maintenance job failed");
                }
            }
        }
    })
}

/// Job execution errors
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_report_clean() {
        let report = SweepReport::default();
        assert!(report.is_clean());
        assert_eq!(report.expired_keys, 0);

        let mut report = SweepReport::default();
        report.errors.push("boom".to_string());
        assert!(!report.is_clean());
    }

    #[test]
    fn test_default_interval() {
        assert_eq!(DEFAULT_SWEEP_INTERVAL, Duration::from_secs(60));
    }
}
