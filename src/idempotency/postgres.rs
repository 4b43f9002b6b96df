//! Postgres-backed idempotency guard
//!
//! Keys live in the `idempotency_keys` table. Reservation takes a
//! first-writer-wins INSERT; losers of the race see the key in flight.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    IdempotencyError, IdempotencyGuard, IdempotencyRecord, IdempotencyStatus, Reservation,
    STALE_AFTER_MINUTES,
};

type RecordRow = (
    Uuid,
    String,
    String,
    Option<serde_json::Value>,
    DateTime<Utc>,
    DateTime<Utc>,
);

/// Idempotency guard backed by the `idempotency_keys` table.
#[derive(Debug, Clone)]
pub struct PgIdempotencyGuard {
    pool: PgPool,
    retention_hours: i64,
}

impl PgIdempotencyGuard {
    pub fn new(pool: PgPool, retention_hours: i64) -> Self {
        Self {
            pool,
            retention_hours,
        }
    }

    /// Get an existing idempotency record
    pub async fn get(&self, key: Uuid) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        let row: Option<RecordRow> = sqlx::query_as(
            r#"
            SELECT key, request_hash, status, result, processing_started_at, expires_at
            FROM idempotency_keys
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(key, request_hash, status, result, processing_started_at, expires_at)| {
                IdempotencyRecord {
                    key,
                    request_hash,
                    status: IdempotencyStatus::parse(&status),
                    result,
                    processing_started_at,
                    expires_at,
                }
            },
        ))
    }
}

impl IdempotencyGuard for PgIdempotencyGuard {
    async fn check_or_reserve(
        &self,
        key: Uuid,
        request_hash: &str,
    ) -> Result<Reservation, IdempotencyError> {
        if let Some(existing) = self.get(key).await? {
            if existing.request_hash != request_hash {
                return Err(IdempotencyError::HashMismatch(key));
            }

            match existing.status {
                IdempotencyStatus::Completed => {
                    return Ok(Reservation::Completed(
                        existing.result.unwrap_or(serde_json::Value::Null),
                    ));
                }
                IdempotencyStatus::Processing => {
                    let age = Utc::now() - existing.processing_started_at;
                    if age < Duration::minutes(STALE_AFTER_MINUTES) {
                        return Ok(Reservation::InFlight);
                    }
                    // Stale reservation; fall through and take it over.
                }
                IdempotencyStatus::Failed => {}
            }

            sqlx::query(
                r#"
                UPDATE idempotency_keys
                SET status = 'processing', processing_started_at = NOW()
                WHERE key = $1
                "#,
            )
            .bind(key)
            .execute(&self.pool)
            .await?;

            return Ok(Reservation::Fresh);
        }

        // Unknown key; first writer wins the reservation.
        let rows = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, request_hash, status, processing_started_at, expires_at)
            VALUES ($1, $2, 'processing', NOW(), NOW() + make_interval(hours => $3::int))
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(request_hash)
        .bind(self.retention_hours as i32)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            // Lost the race to a concurrent caller.
            return Ok(Reservation::InFlight);
        }

        Ok(Reservation::Fresh)
    }

    async fn complete(
        &self,
        key: Uuid,
        result: &serde_json::Value,
    ) -> Result<(), IdempotencyError> {
        let rows = sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET status = 'completed', result = $2
            WHERE key = $1
            "#,
        )
        .bind(key)
        .bind(result)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(IdempotencyError::NotFound(key));
        }

        Ok(())
    }

    async fn fail(&self, key: Uuid) -> Result<(), IdempotencyError> {
        let rows = sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET status = 'failed'
            WHERE key = $1
            "#,
        )
        .bind(key)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(IdempotencyError::NotFound(key));
        }

        Ok(())
    }
}
