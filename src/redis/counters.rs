// Fixed-window rate limit counters in Redis

use ::redis::{aio::ConnectionManager, AsyncCommands, Script};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;

use crate::errors::Result;
use crate::store::{RateLimitStore, WindowCount};

const RATE_LIMIT_PREFIX: &str = "ratelimit:";

// INCR and window start in one step; the key's TTL is the window.
static INCREMENT_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local count = redis.call('INCR', KEYS[1])
        local ttl = redis.call('PTTL', KEYS[1])
        if count == 1 or ttl < 0 then
            redis.call('PEXPIRE', KEYS[1], ARGV[1])
            ttl = tonumber(ARGV[1])
        end
        return {count, ttl}
        "#,
    )
});

pub struct RedisRateLimitStore {
    manager: ConnectionManager,
}

impl RedisRateLimitStore {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn increment(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<WindowCount> {
        let redis_key = format!("{}{}", RATE_LIMIT_PREFIX, key);
        let window_ms = window.num_milliseconds().max(1);

        let mut manager = self.manager.clone();
        let (count, ttl_ms): (i64, i64) = INCREMENT_SCRIPT
            .key(&redis_key)
            .arg(window_ms)
            .invoke_async(&mut manager)
            .await?;

        Ok(WindowCount {
            count: count.max(0) as u64,
            reset_at: now + Duration::milliseconds(ttl_ms.max(0)),
        })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let redis_key = format!("{}{}", RATE_LIMIT_PREFIX, key);
        let mut manager = self.manager.clone();
        manager.del::<_, ()>(&redis_key).await?;
        Ok(())
    }
}
