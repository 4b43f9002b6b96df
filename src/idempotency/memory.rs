//! In-memory idempotency guard
//!
//! Same key lifecycle as the Postgres backend, held in a mutex-guarded
//! map. Used by the engine tests and local development.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use uuid::Uuid;

use super::{
    IdempotencyError, IdempotencyGuard, IdempotencyRecord, IdempotencyStatus, Reservation,
    STALE_AFTER_MINUTES,
};

const DEFAULT_RETENTION_HOURS: i64 = 24;

/// Idempotency guard holding all keys in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryIdempotencyGuard {
    records: Arc<Mutex<HashMap<Uuid, IdempotencyRecord>>>,
}

impl MemoryIdempotencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status of a key, if known. Test helper.
    pub fn status_of(&self, key: Uuid) -> Option<IdempotencyStatus> {
        let records = self.records.lock().expect("idempotency lock poisoned");
        records.get(&key).map(|r| r.status)
    }
}

impl IdempotencyGuard for MemoryIdempotencyGuard {
    async fn check_or_reserve(
        &self,
        key: Uuid,
        request_hash: &str,
    ) -> Result<Reservation, IdempotencyError> {
        let mut records = self.records.lock().expect("idempotency lock poisoned");

        if let Some(existing) = records.get_mut(&key) {
            if existing.request_hash != request_hash {
                return Err(IdempotencyError::HashMismatch(key));
            }

            match existing.status {
                IdempotencyStatus::Completed => {
                    return Ok(Reservation::Completed(
                        existing.result.clone().unwrap_or(serde_json::Value::Null),
                    ));
                }
                IdempotencyStatus::Processing => {
                    let age = Utc::now() - existing.processing_started_at;
                    if age < Duration::minutes(STALE_AFTER_MINUTES) {
                        return Ok(Reservation::InFlight);
                    }
                }
                IdempotencyStatus::Failed => {}
            }

            existing.status = IdempotencyStatus::Processing;
            existing.processing_started_at = Utc::now();
            return Ok(Reservation::Fresh);
        }

        let now = Utc::now();
        records.insert(
            key,
            IdempotencyRecord {
                key,
                request_hash: request_hash.to_string(),
                status: IdempotencyStatus::Processing,
                result: None,
                processing_started_at: now,
                expires_at: now + Duration::hours(DEFAULT_RETENTION_HOURS),
            },
        );

        Ok(Reservation::Fresh)
    }

    async fn complete(
        &self,
        key: Uuid,
        result: &serde_json::Value,
    ) -> Result<(), IdempotencyError> {
        let mut records = self.records.lock().expect("idempotency lock poisoned");

        let record = records
            .get_mut(&key)
            .ok_or(IdempotencyError::NotFound(key))?;
        record.status = IdempotencyStatus::Completed;
        record.result = Some(result.clone());

        Ok(())
    }

    async fn fail(&self, key: Uuid) -> Result<(), IdempotencyError> {
        let mut records = self.records.lock().expect("idempotency lock poisoned");

        let record = records
            .get_mut(&key)
            .ok_or(IdempotencyError::NotFound(key))?;
        record.status = IdempotencyStatus::Failed;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fresh_then_in_flight_then_completed() {
        let guard = MemoryIdempotencyGuard::new();
        let key = Uuid::new_v4();

        let first = guard.check_or_reserve(key, "hash-a").await.unwrap();
        assert_eq!(first, Reservation::Fresh);

        let second = guard.check_or_reserve(key, "hash-a").await.unwrap();
        assert_eq!(second, Reservation::InFlight);

        guard.complete(key, &json!({"ok": true})).await.unwrap();

        let third = guard.check_or_reserve(key, "hash-a").await.unwrap();
        assert_eq!(third, Reservation::Completed(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_hash_mismatch_rejected() {
        let guard = MemoryIdempotencyGuard::new();
        let key = Uuid::new_v4();

        guard.check_or_reserve(key, "hash-a").await.unwrap();

        let result = guard.check_or_reserve(key, "hash-b").await;
        assert!(matches!(result, Err(IdempotencyError::HashMismatch(_))));
    }

    #[tokio::test]
    async fn test_failed_key_can_be_retried() {
        let guard = MemoryIdempotencyGuard::new();
        let key = Uuid::new_v4();

        guard.check_or_reserve(key, "hash-a").await.unwrap();
        guard.fail(key).await.unwrap();

        let retry = guard.check_or_reserve(key, "hash-a").await.unwrap();
        assert_eq!(retry, Reservation::Fresh);
    }

    #[tokio::test]
    async fn test_complete_unknown_key() {
        let guard = MemoryIdempotencyGuard::new();

        let result = guard.complete(Uuid::new_v4(), &json!({})).await;
        assert!(matches!(result, Err(IdempotencyError::NotFound(_))));
    }
}
