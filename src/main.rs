use keygate::{
    api::{create_router, AppState, Stores},
    audit::PostgresAuditStore,
    clock::{Clock, SystemClock},
    config::{Config, StorageBackend},
    db::{create_pool, run_migrations, PostgresAccountStore, PostgresApiKeyStore},
    maintenance::RetentionSweeper,
    observability::{health::PostgresProbe, health::RedisProbe, init_tracing, HealthProbe},
    redis::{create_client, RedisIdempotencyStore, RedisRateLimitStore},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    config.validate()?;

    init_tracing(&config.observability)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = ?config.storage.backend,
        "Starting keygate"
    );

    let (stores, probes) = connect_stores(&config).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let sweep_every = Duration::from_secs(config.maintenance.interval_seconds);

    let state = AppState::new(config, stores, probes, clock)?;
    let sweeper = RetentionSweeper::new(
        state.registry.clone(),
        state.ledger.clone(),
        state.audit.clone(),
        sweep_every,
    )
    .spawn();
    let audit = state.audit.clone();

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    sweeper.abort();
    audit.flush().await;
    tracing::info!("Keygate stopped");

    Ok(())
}

async fn connect_stores(config: &Config) -> anyhow::Result<(Stores, Vec<Arc<dyn HealthProbe>>)> {
    match config.storage.backend {
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; nothing will survive a restart");
            Ok((Stores::in_memory(), Vec::new()))
        }
        StorageBackend::Postgres => {
            let pool = create_pool(&config.database).await?;
            run_migrations(&pool).await?;
            let redis = create_client(&config.redis).await?;

            let stores = Stores {
                accounts: Arc::new(PostgresAccountStore::new(pool.clone())),
                api_keys: Arc::new(PostgresApiKeyStore::new(pool.clone())),
                audit: Arc::new(PostgresAuditStore::new(pool.clone())),
                idempotency: Arc::new(RedisIdempotencyStore::new(redis.clone())),
                rate_limits: Arc::new(RedisRateLimitStore::new(redis.clone())),
            };
            let probes: Vec<Arc<dyn HealthProbe>> =
                vec![Arc::new(PostgresProbe(pool)), Arc::new(RedisProbe(redis))];
            Ok((stores, probes))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
