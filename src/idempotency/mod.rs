//! Idempotency Guard
//!
//! Deduplicates client-submitted operations by a caller-supplied key. A key
//! moves Fresh -> InFlight -> Completed (or Failed, which permits a retry);
//! a concurrent caller holding the same key while it is in flight gets a
//! conflict rather than a second execution. Entries expire after a
//! retention window to bound storage; expiry is enforced by the maintenance
//! jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryIdempotencyGuard;
pub use postgres::PgIdempotencyGuard;

/// How long a reservation may sit in `Processing` before another caller is
/// allowed to take it over.
pub const STALE_AFTER_MINUTES: i64 = 5;

/// Lifecycle state of a stored idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Processing,
    Completed,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::Processing => "processing",
            IdempotencyStatus::Completed => "completed",
            IdempotencyStatus::Failed => "failed",
        }
    }

    /// Stored representation back to a status. Unknown strings read as
    /// `Processing`, the most conservative interpretation.
    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => IdempotencyStatus::Completed,
            "failed" => IdempotencyStatus::Failed,
            _ => IdempotencyStatus::Processing,
        }
    }
}

/// Outcome of attempting to reserve a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// Key was unknown (or failed/stale) and is now reserved by this caller
    Fresh,
    /// Another caller holds the key and has not finished
    InFlight,
    /// The operation already completed; the recorded result is returned
    Completed(serde_json::Value),
}

/// Idempotency guard errors
#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Request hash mismatch for key {0}")]
    HashMismatch(Uuid),

    #[error("Key not found: {0}")]
    NotFound(Uuid),
}

/// Stored idempotency record (exposed for jobs and tests)
#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    pub key: Uuid,
    pub request_hash: String,
    pub status: IdempotencyStatus,
    pub result: Option<serde_json::Value>,
    pub processing_started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Contract for idempotency key storage.
#[allow(async_fn_in_trait)]
pub trait IdempotencyGuard {
    /// Check the key's state and reserve it when it is free. The request
    /// hash must match on every call with the same key.
    async fn check_or_reserve(
        &self,
        key: Uuid,
        request_hash: &str,
    ) -> Result<Reservation, IdempotencyError>;

    /// Record the operation's result and mark the key completed.
    async fn complete(
        &self,
        key: Uuid,
        result: &serde_json::Value,
    ) -> Result<(), IdempotencyError>;

    /// Mark the key failed, releasing it for a retry with the same key.
    async fn fail(&self, key: Uuid) -> Result<(), IdempotencyError>;
}

/// Compute the SHA-256 hash of a request body for conflict detection.
pub fn compute_request_hash(body: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}
