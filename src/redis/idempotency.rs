// Idempotency records in Redis
//
// Layout:
//   idempotency:fp:{fingerprint} -> hash { id, record, status, response, expires_at_ms }
//   idempotency:id:{record id}   -> fingerprint
// Both keys carry the retention window as their TTL.

use ::redis::{aio::ConnectionManager, AsyncCommands, Script};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::{CachedResponse, IdempotencyRecord, IdempotencyStatus};
use crate::errors::{AppError, Result};
use crate::store::{IdempotencyStore, InsertOutcome};

const FINGERPRINT_PREFIX: &str = "idempotency:fp:";
const ID_PREFIX: &str = "idempotency:id:";

static INSERT_IF_ABSENT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local expires = redis.call('HGET', KEYS[1], 'expires_at_ms')
        if expires and tonumber(expires) > tonumber(ARGV[3]) then
            return 0
        end
        redis.call('DEL', KEYS[1])
        redis.call('HSET', KEYS[1], 'id', ARGV[5], 'record', ARGV[1], 'status', 'pending',
                   'expires_at_ms', ARGV[4])
        redis.call('PEXPIRE', KEYS[1], ARGV[2])
        redis.call('SET', KEYS[2], ARGV[6], 'PX', ARGV[2])
        return 1
        "#,
    )
});

static COMPLETE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('HGET', KEYS[1], 'id') ~= ARGV[2] then
            return 0
        end
        if redis.call('HGET', KEYS[1], 'status') ~= 'pending' then
            return -1
        end
        redis.call('HSET', KEYS[1], 'status', 'completed', 'response', ARGV[1])
        return 1
        "#,
    )
});

static ABANDON: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('HGET', KEYS[1], 'id') == ARGV[1]
            and redis.call('HGET', KEYS[1], 'status') == 'pending' then
            redis.call('DEL', KEYS[1])
        end
        redis.call('DEL', KEYS[2])
        return 1
        "#,
    )
});

pub struct RedisIdempotencyStore {
    manager: ConnectionManager,
}

impl RedisIdempotencyStore {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    async fn fingerprint_for(&self, record_id: Uuid) -> Result<Option<String>> {
        let mut manager = self.manager.clone();
        let fingerprint: Option<String> = manager.get(format!("{}{}", ID_PREFIX, record_id)).await?;
        Ok(fingerprint)
    }
}

fn decode(fields: HashMap<String, String>) -> Result<Option<IdempotencyRecord>> {
    let Some(raw) = fields.get("record") else {
        return Ok(None);
    };
    let mut record: IdempotencyRecord = serde_json::from_str(raw)?;
    record.status = match fields.get("status").map(String::as_str) {
        Some("completed") => IdempotencyStatus::Completed,
        _ => IdempotencyStatus::Pending,
    };
    record.response = fields
        .get("response")
        .map(|r| serde_json::from_str::<CachedResponse>(r))
        .transpose()?;
    Ok(Some(record))
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn get(&self, fingerprint: &str) -> Result<Option<IdempotencyRecord>> {
        let mut manager = self.manager.clone();
        let fields: HashMap<String, String> = manager
            .hgetall(format!("{}{}", FINGERPRINT_PREFIX, fingerprint))
            .await?;
        decode(fields)
    }

    async fn insert_if_absent(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome> {
        let ttl_ms = (record.expires_at - now).num_milliseconds().max(1);
        let payload = serde_json::to_string(record)?;

        // A record can expire between the failed insert and the read; one retry covers it.
        for _ in 0..2 {
            let mut manager = self.manager.clone();
            let inserted: i64 = INSERT_IF_ABSENT
                .key(format!("{}{}", FINGERPRINT_PREFIX, record.fingerprint))
                .key(format!("{}{}", ID_PREFIX, record.id))
                .arg(&payload)
                .arg(ttl_ms)
                .arg(now.timestamp_millis())
                .arg(record.expires_at.timestamp_millis())
                .arg(record.id.to_string())
                .arg(&record.fingerprint)
                .invoke_async(&mut manager)
                .await?;

            if inserted == 1 {
                return Ok(InsertOutcome::Inserted);
            }
            if let Some(existing) = self.get(&record.fingerprint).await? {
                return Ok(InsertOutcome::Exists(existing));
            }
        }

        Err(AppError::StoreUnavailable(
            "idempotency record changed during insert".to_string(),
        ))
    }

    async fn complete(&self, record_id: Uuid, response: &CachedResponse) -> Result<()> {
        let fingerprint = self
            .fingerprint_for(record_id)
            .await?
            .ok_or(AppError::IdempotencyRecordNotFound)?;

        let mut manager = self.manager.clone();
        let outcome: i64 = COMPLETE
            .key(format!("{}{}", FINGERPRINT_PREFIX, fingerprint))
            .arg(serde_json::to_string(response)?)
            .arg(record_id.to_string())
            .invoke_async(&mut manager)
            .await?;

        match outcome {
            1 => Ok(()),
            -1 => Err(AppError::IdempotencyNotPending),
            _ => Err(AppError::IdempotencyRecordNotFound),
        }
    }

    async fn abandon(&self, record_id: Uuid) -> Result<()> {
        let Some(fingerprint) = self.fingerprint_for(record_id).await? else {
            return Ok(());
        };

        let mut manager = self.manager.clone();
        let _: i64 = ABANDON
            .key(format!("{}{}", FINGERPRINT_PREFIX, fingerprint))
            .key(format!("{}{}", ID_PREFIX, record_id))
            .arg(record_id.to_string())
            .invoke_async(&mut manager)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<u64> {
        // Key TTLs evict records; reads still check `expires_at` themselves.
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn store() -> RedisIdempotencyStore {
        let config = crate::config::RedisConfig {
            url: "redis://localhost:6379".to_string(),
            connection_timeout_seconds: 5,
        };
        RedisIdempotencyStore::new(crate::redis::create_client(&config).await.unwrap())
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_insert_complete_and_replay() {
        let store = store().await;
        let now = Utc::now();
        let fingerprint = format!("test-{}", Uuid::new_v4());
        let record = IdempotencyRecord::pending(None, fingerprint.clone(), now, Duration::hours(24));

        assert_eq!(
            store.insert_if_absent(&record, now).await.unwrap(),
            InsertOutcome::Inserted
        );

        let duplicate = IdempotencyRecord::pending(None, fingerprint.clone(), now, Duration::hours(24));
        assert!(matches!(
            store.insert_if_absent(&duplicate, now).await.unwrap(),
            InsertOutcome::Exists(existing) if existing.id == record.id
        ));

        let response = CachedResponse {
            status: 201,
            content_type: Some("application/json".to_string()),
            body: "{}".to_string(),
        };
        store.complete(record.id, &response).await.unwrap();
        assert!(matches!(
            store.complete(record.id, &response).await,
            Err(AppError::IdempotencyNotPending)
        ));

        let stored = store.get(&fingerprint).await.unwrap().unwrap();
        assert_eq!(stored.status, IdempotencyStatus::Completed);
        assert_eq!(stored.response, Some(response));
    }
}
