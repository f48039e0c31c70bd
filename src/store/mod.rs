//! Storage seams for every backing store the service depends on.
//!
//! Each trait only promises atomic single-key operations. PostgreSQL and Redis
//! implementations live in `crate::db` and `crate::redis`; `memory` holds the
//! in-process versions used for development and tests.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{
    Account, AccountStatus, ApiKey, AuditEvent, AuditQuery, CachedResponse, IdempotencyRecord,
};
use crate::errors::{AppError, Result};

pub use memory::{
    InMemoryAccountStore, InMemoryApiKeyStore, InMemoryAuditStore, InMemoryIdempotencyStore,
    InMemoryRateLimitStore,
};

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Fails with `AccountAlreadyExists` when the name is taken.
    async fn insert(&self, account: &Account) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<Account>>;

    async fn update_status(
        &self,
        id: Uuid,
        status: AccountStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<()>;
}

#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn insert(&self, key: &ApiKey) -> Result<()>;

    async fn get(&self, key_id: Uuid) -> Result<Option<ApiKey>>;

    /// Secondary-index lookup; must not scan.
    async fn find_by_lookup_hash(&self, lookup_hash: &str) -> Result<Option<ApiKey>>;

    /// Flips an active key to inactive. Returns whether this call made the change.
    async fn deactivate(&self, key_id: Uuid) -> Result<bool>;

    async fn touch_last_used(&self, key_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Page of an account's keys, newest first, plus the account's total key count.
    async fn list(&self, account_id: Uuid, limit: u32, offset: u32) -> Result<(Vec<ApiKey>, u64)>;

    /// Deletes keys whose expiry is before `cutoff`.
    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A live record already holds the fingerprint.
    Exists(IdempotencyRecord),
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(&self, fingerprint: &str) -> Result<Option<IdempotencyRecord>>;

    /// Atomic insert-if-absent. A record expired at `now` counts as absent and is replaced.
    async fn insert_if_absent(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome>;

    /// Atomic `pending -> completed`. `IdempotencyRecordNotFound` or `IdempotencyNotPending` otherwise.
    async fn complete(&self, record_id: Uuid, response: &CachedResponse) -> Result<()>;

    /// Drops a record that is still pending so the client can retry.
    async fn abandon(&self, record_id: Uuid) -> Result<()>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Counter state after an increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: u64,
    pub reset_at: DateTime<Utc>,
}

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomically increments `key`, starting a fresh window of `window` when none is live.
    async fn increment(
        &self,
        key: &str,
        window: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowCount>;

    async fn reset(&self, key: &str) -> Result<()>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, events: &[AuditEvent]) -> Result<()>;

    /// Events matching `query`, ordered by sort key.
    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>>;

    /// Hash of the most recently appended event, for resuming the chain.
    async fn latest_hash(&self) -> Result<Option<String>>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Runs one store call under a bounded deadline.
pub async fn with_deadline<T, F>(deadline: Duration, operation: &'static str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                operation,
                timeout_ms = deadline.as_millis() as u64,
                "Store call exceeded its deadline"
            );
            Err(AppError::StoreTimeout(operation))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deadline_elapses() {
        let result: Result<()> = with_deadline(Duration::from_millis(10), "slow_call", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(AppError::StoreTimeout("slow_call"))));
    }

    #[tokio::test]
    async fn test_deadline_passes_through_results() {
        let result = with_deadline(Duration::from_secs(1), "fast_call", async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
