use axum::{
    extract::{MatchedPath, Request},
    http::{header, HeaderName, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state, Next},
    response::Response,
    routing::{delete, get, post},
    Router,
};
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    accounts::AccountService,
    api::{accounts, api_keys, audit, auth, health},
    audit::AuditRecorder,
    auth::{require_api_key, ApiKeyRegistry, Authenticator, KeyMaterialManager},
    clock::Clock,
    config::{Config, SecurityConfig},
    errors::Result,
    idempotency::{idempotency_middleware, IdempotencyLedger},
    observability::{HealthChecker, HealthProbe, MetricsRecorder},
    rate_limit::{account_rate_limit, endpoint_rate_limit, ip_rate_limit, RateLimiter},
    store::{AccountStore, ApiKeyStore, AuditStore, IdempotencyStore, RateLimitStore},
};

/// Every backing store the service needs, behind its trait.
#[derive(Clone)]
pub struct Stores {
    pub accounts: Arc<dyn AccountStore>,
    pub api_keys: Arc<dyn ApiKeyStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub rate_limits: Arc<dyn RateLimitStore>,
    pub audit: Arc<dyn AuditStore>,
}

impl Stores {
    /// Process-local stores. Nothing survives a restart.
    pub fn in_memory() -> Self {
        use crate::store::memory::*;
        Self {
            accounts: Arc::new(InMemoryAccountStore::new()),
            api_keys: Arc::new(InMemoryApiKeyStore::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
            rate_limits: Arc::new(InMemoryRateLimitStore::new()),
            audit: Arc::new(InMemoryAuditStore::new()),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub accounts: AccountService,
    pub registry: ApiKeyRegistry,
    pub authenticator: Authenticator,
    pub ledger: IdempotencyLedger,
    pub limiter: RateLimiter,
    pub audit: AuditRecorder,
    pub health: Arc<HealthChecker>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Wires the services over `stores`. Starts the audit writer, so it must
    /// run inside a Tokio runtime.
    pub fn new(
        config: Config,
        stores: Stores,
        probes: Vec<Arc<dyn HealthProbe>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let deadline = config.storage.deadline();

        let audit = AuditRecorder::spawn(stores.audit, clock.clone(), &config.audit, deadline);
        let registry = ApiKeyRegistry::new(
            stores.api_keys,
            stores.accounts.clone(),
            KeyMaterialManager::new(&config.crypto)?,
            audit.clone(),
            clock.clone(),
            config.api_keys.clone(),
            deadline,
        );
        let authenticator = Authenticator::new(registry.clone(), audit.clone());
        let accounts = AccountService::new(
            stores.accounts,
            registry.clone(),
            audit.clone(),
            clock.clone(),
            deadline,
        );
        let ledger = IdempotencyLedger::new(
            stores.idempotency,
            clock.clone(),
            ChronoDuration::hours(config.idempotency.retention_hours),
            deadline,
        );
        let limiter = RateLimiter::new(
            stores.rate_limits,
            clock.clone(),
            config.rate_limit.clone(),
            deadline,
        );

        Ok(Self {
            config: Arc::new(config),
            accounts,
            registry,
            authenticator,
            ledger,
            limiter,
            audit,
            health: Arc::new(HealthChecker::new(probes)),
            clock,
        })
    }
}

pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));
    if state.config.observability.metrics_enabled {
        router = router.route("/metrics", get(health::metrics));
    }

    let mut router = router
        .nest("/v1", v1_routes(state.clone()))
        .layer(from_fn(track_metrics))
        .layer(TraceLayer::new_for_http());
    if state.config.security.cors_enabled {
        router = router.layer(cors_layer(&state.config.security));
    }

    router.with_state(state)
}

fn v1_routes(state: AppState) -> Router<AppState> {
    // Layers listed bottom-up: the last one added runs first.
    let protected = Router::new()
        .route("/api-keys", post(api_keys::issue))
        .route("/api-keys/:key_id", delete(api_keys::revoke))
        .route("/accounts/:account_id/api-keys", get(api_keys::list))
        .route("/audit/events", get(audit::query_events))
        .route_layer(from_fn_with_state(state.clone(), idempotency_middleware))
        .route_layer(from_fn_with_state(state.clone(), account_rate_limit))
        .route_layer(from_fn_with_state(state.clone(), require_api_key));

    let public = Router::new()
        .route("/accounts", post(accounts::register))
        .route_layer(from_fn_with_state(state.clone(), idempotency_middleware))
        .route("/auth/validate", post(auth::validate));

    public
        .merge(protected)
        .layer(from_fn_with_state(state.clone(), endpoint_rate_limit))
        .layer(from_fn_with_state(state, ip_rate_limit))
}

fn cors_layer(security: &SecurityConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = security
        .cors_allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("idempotency-key"),
            HeaderName::from_static("x-idempotency-key"),
        ])
        .max_age(Duration::from_secs(3600));

    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(origins))
    }
}

async fn track_metrics(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;

    MetricsRecorder::record_http_request(&method, &path, response.status().as_u16());
    MetricsRecorder::record_http_duration(&method, &path, start.elapsed().as_secs_f64());
    response
}
