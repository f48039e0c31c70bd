use ::redis::{aio::ConnectionManager, Client};
use std::time::Duration;

use crate::config::RedisConfig;
use crate::errors::{AppError, Result};

/// Opens the shared connection used by the counter and idempotency stores.
///
/// The manager reconnects on its own after the first successful connect, so
/// only the initial handshake is bounded here.
pub async fn create_client(config: &RedisConfig) -> Result<ConnectionManager> {
    let timeout = Duration::from_secs(config.connection_timeout_seconds);
    tracing::info!(timeout_secs = timeout.as_secs(), "Connecting to Redis");

    let client = Client::open(config.url.as_str())?;
    let manager = tokio::time::timeout(timeout, ConnectionManager::new(client))
        .await
        .map_err(|_| AppError::StoreUnavailable("Redis connection timed out".to_string()))??;

    tracing::info!("Redis connection established");
    Ok(manager)
}

/// Round-trips a PING on a clone of the shared connection.
pub async fn ping(manager: &ConnectionManager) -> Result<()> {
    let mut conn = manager.clone();
    let reply: String = ::redis::cmd("PING").query_async(&mut conn).await?;
    if reply != "PONG" {
        return Err(AppError::StoreUnavailable(format!(
            "unexpected PING reply: {reply}"
        )));
    }
    Ok(())
}
