#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tower::ServiceExt;
use uuid::Uuid;

use keygate::api::{create_router, AppState, Stores};
use keygate::clock::{Clock, SystemClock};
use keygate::config::*;
use keygate::domain::{Account, AccountStatus};
use keygate::errors::{AppError, Result};
use keygate::store::{AccountStore, InMemoryAccountStore};

pub fn test_config() -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
        },
        storage: StorageConfig::default(),
        database: DatabaseConfig {
            url: String::new(),
            max_connections: 1,
            min_connections: 1,
            acquire_timeout_seconds: 1,
            idle_timeout_seconds: 60,
        },
        redis: RedisConfig {
            url: String::new(),
            connection_timeout_seconds: 1,
        },
        api_keys: ApiKeyConfig::default(),
        // Cheap hashes keep the suite fast.
        crypto: CryptoConfig {
            argon2_memory_kib: 1024,
            argon2_iterations: 1,
            argon2_parallelism: 1,
        },
        rate_limit: RateLimitConfig::default(),
        idempotency: IdempotencyConfig::default(),
        audit: AuditConfig::default(),
        maintenance: MaintenanceConfig {
            interval_seconds: 300,
        },
        observability: ObservabilityConfig {
            log_level: "warn".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
        },
        security: SecurityConfig {
            cors_enabled: false,
            cors_allowed_origins: Vec::new(),
            trust_forwarded_headers: true,
        },
    }
}

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_stores(config, Stores::in_memory())
    }

    pub fn with_stores(config: Config, stores: Stores) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let state = AppState::new(config, stores, Vec::new(), clock).unwrap();
        let router = create_router(state.clone());
        Self { state, router }
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        TestResponse {
            status,
            headers,
            body,
        }
    }

    /// Registers an account and returns `(account_id, bootstrap secret)`.
    pub async fn register(&self, name: &str) -> (String, String) {
        let response = self
            .send(json_request("POST", "/v1/accounts", None, json!({ "name": name })))
            .await;
        assert_eq!(response.status, StatusCode::CREATED, "{}", response.body);
        (
            response.body["account"]["account_id"]
                .as_str()
                .unwrap()
                .to_string(),
            response.body["api_key"]["api_key"]
                .as_str()
                .unwrap()
                .to_string(),
        )
    }
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

pub fn json_request(method: &str, uri: &str, api_key: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-forwarded-for", "203.0.113.7");
    if let Some(key) = api_key {
        builder = builder.header("x-api-key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn empty_request(method: &str, uri: &str, api_key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-forwarded-for", "203.0.113.7");
    if let Some(key) = api_key {
        builder = builder.header("x-api-key", key);
    }
    builder.body(Body::empty()).unwrap()
}

/// Account store whose inserts can be held open or made to fail once.
pub struct ControlledAccountStore {
    inner: InMemoryAccountStore,
    hold: AtomicBool,
    fail_next: AtomicBool,
    pub entered: Notify,
    pub release: Notify,
}

impl ControlledAccountStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryAccountStore::new(),
            hold: AtomicBool::new(false),
            fail_next: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }

    /// The next insert signals `entered` and waits for `release`.
    pub fn hold_next_insert(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_insert(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl AccountStore for ControlledAccountStore {
    async fn insert(&self, account: &Account) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(AppError::StoreUnavailable("accounts table offline".into()));
        }
        if self.hold.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.insert(account).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Account>> {
        self.inner.get(id).await
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: AccountStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.inner.update_status(id, status, updated_at).await
    }
}
