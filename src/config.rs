use crate::errors::{AppError, Result};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub api_keys: ApiKeyConfig,
    pub crypto: CryptoConfig,
    pub rate_limit: RateLimitConfig,
    pub idempotency: IdempotencyConfig,
    pub audit: AuditConfig,
    pub maintenance: MaintenanceConfig,
    pub observability: ObservabilityConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// PostgreSQL for accounts, keys and audit; Redis for counters and idempotency.
    Postgres,
    /// Everything in process. Development and tests only.
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Deadline applied to every individual store call.
    pub timeout_ms: u64,
}

impl StorageConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyConfig {
    /// Lifetime given to keys issued without an explicit ttl.
    pub default_ttl_hours: i64,
    pub max_ttl_hours: i64,
    /// How long expired keys stay listable before the sweeper deletes them.
    pub expired_key_retention_days: i64,
}

impl Default for ApiKeyConfig {
    fn default() -> Self {
        Self {
            default_ttl_hours: 2_160,
            max_ttl_hours: 8_760,
            expired_key_retention_days: 30,
        }
    }
}

/// Argon2id cost parameters for new storage hashes.
#[derive(Debug, Clone, Deserialize)]
pub struct CryptoConfig {
    pub argon2_memory_kib: u32,
    pub argon2_iterations: u32,
    pub argon2_parallelism: u32,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            argon2_memory_kib: 19_456,
            argon2_iterations: 2,
            argon2_parallelism: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitPolicy {
    pub enabled: bool,
    pub requests: u64,
    pub window_seconds: u64,
}

impl RateLimitPolicy {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_seconds as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub ip: RateLimitPolicy,
    pub account: RateLimitPolicy,
    pub endpoint: RateLimitPolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            ip: RateLimitPolicy {
                enabled: true,
                requests: 100,
                window_seconds: 60,
            },
            account: RateLimitPolicy {
                enabled: true,
                requests: 1_000,
                window_seconds: 60,
            },
            endpoint: RateLimitPolicy {
                enabled: true,
                requests: 10_000,
                window_seconds: 60,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdempotencyConfig {
    pub retention_hours: i64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self { retention_hours: 24 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    pub enabled: bool,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub channel_buffer_size: usize,
    pub retention_days: i64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 100,
            batch_timeout_ms: 1_000,
            channel_buffer_size: 10_000,
            retention_days: crate::domain::audit::AUDIT_RETENTION_DAYS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceConfig {
    pub interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
    pub metrics_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub cors_enabled: bool,
    pub cors_allowed_origins: Vec<String>,
    /// Trust `X-Forwarded-For` / `X-Real-IP` for the source address. Only
    /// enable behind a proxy that overwrites these headers.
    pub trust_forwarded_headers: bool,
}

impl Config {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let environment = env::var("KEYGATE_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(
                config::File::with_name(&format!("config/{}", environment)).required(false),
            )
            // e.g., KEYGATE__SERVER__PORT=8080
            .add_source(
                config::Environment::with_prefix("KEYGATE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AppError::Configuration(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| AppError::Configuration(e.to_string()))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(AppError::Configuration("Invalid port number".to_string()));
        }

        if self.storage.timeout_ms == 0 {
            return Err(AppError::Configuration(
                "storage.timeout_ms must be positive".to_string(),
            ));
        }

        if self.storage.backend == StorageBackend::Postgres {
            if self.database.url.is_empty() {
                return Err(AppError::Configuration("Database URL is required".to_string()));
            }
            if self.redis.url.is_empty() {
                return Err(AppError::Configuration("Redis URL is required".to_string()));
            }
        }

        let keys = &self.api_keys;
        if keys.max_ttl_hours <= 0
            || keys.default_ttl_hours <= 0
            || keys.default_ttl_hours > keys.max_ttl_hours
        {
            return Err(AppError::Configuration(
                "api_keys.default_ttl_hours must be positive and at most max_ttl_hours".to_string(),
            ));
        }

        for (name, policy) in [
            ("ip", &self.rate_limit.ip),
            ("account", &self.rate_limit.account),
            ("endpoint", &self.rate_limit.endpoint),
        ] {
            if policy.enabled && (policy.requests == 0 || policy.window_seconds == 0) {
                return Err(AppError::Configuration(format!(
                    "rate_limit.{} needs positive requests and window_seconds",
                    name
                )));
            }
        }

        if self.idempotency.retention_hours <= 0 {
            return Err(AppError::Configuration(
                "idempotency.retention_hours must be positive".to_string(),
            ));
        }

        if self.audit.batch_size == 0 || self.audit.channel_buffer_size == 0 {
            return Err(AppError::Configuration(
                "audit batch and channel sizes must be positive".to_string(),
            ));
        }

        if self.audit.batch_timeout_ms == 0 {
            return Err(AppError::Configuration(
                "audit.batch_timeout_ms must be positive".to_string(),
            ));
        }

        if self.maintenance.interval_seconds == 0 {
            return Err(AppError::Configuration(
                "maintenance.interval_seconds must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let mut config = Config::load().expect("Failed to load config");
        assert!(config.validate().is_ok());

        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_ttl_cannot_exceed_max() {
        let mut config = Config::load().expect("Failed to load config");
        config.api_keys.default_ttl_hours = config.api_keys.max_ttl_hours + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_audit_batching_needs_positive_size_and_timeout() {
        let mut config = Config::load().expect("Failed to load config");
        config.audit.batch_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(AppError::Configuration(_))));

        config.audit.batch_timeout_ms = 1_000;
        config.audit.batch_size = 0;
        assert!(matches!(config.validate(), Err(AppError::Configuration(_))));
    }

    #[test]
    fn test_forwarded_headers_untrusted_by_default() {
        let config = Config::load().expect("Failed to load config");
        assert!(!config.security.trust_forwarded_headers);
    }

    #[test]
    fn test_enabled_policy_needs_window() {
        let mut config = Config::load().expect("Failed to load config");
        config.rate_limit.account.window_seconds = 0;
        assert!(config.validate().is_err());

        config.rate_limit.account.enabled = false;
        assert!(config.validate().is_ok());
    }
}
