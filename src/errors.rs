use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::domain::Permission;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    // Storage errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    DatabaseMigration(#[from] sqlx::migrate::MigrateError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store operation `{0}` exceeded its deadline")]
    StoreTimeout(&'static str),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    // Input validation errors
    #[error("Unknown permission `{0}`")]
    InvalidPermission(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Invalid expiry: {0}")]
    InvalidExpiry(String),

    #[error("Invalid pagination: {0}")]
    InvalidPagination(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    // Authentication outcomes surfaced over HTTP
    #[error("Missing API key")]
    MissingApiKey,

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Missing permission `{0}`")]
    InsufficientPermissions(Permission),

    #[error("Resource belongs to another account")]
    ForeignAccount,

    // Accounts
    #[error("Account not found")]
    AccountNotFound,

    #[error("Account already exists")]
    AccountAlreadyExists,

    #[error("Account is not active")]
    AccountInactive,

    #[error("Account status cannot change from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    // API keys
    #[error("API key not found")]
    ApiKeyNotFound,

    // Idempotency
    #[error("A request with this idempotency key is already in progress")]
    IdempotencyKeyPending,

    #[error("Idempotency record is not pending")]
    IdempotencyNotPending,

    #[error("Idempotency record not found")]
    IdempotencyRecordNotFound,

    // Rate limiting
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cryptographic error: {0}")]
    Cryptographic(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_)
            | AppError::DatabaseMigration(_)
            | AppError::Redis(_)
            | AppError::StoreTimeout(_)
            | AppError::StoreUnavailable(_) => "service_unavailable",
            AppError::InvalidPermission(_) => "invalid_permission",
            AppError::InvalidName(_) => "invalid_name",
            AppError::InvalidExpiry(_) => "invalid_expiry",
            AppError::InvalidPagination(_) => "invalid_pagination",
            AppError::InvalidQuery(_) => "invalid_query",
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::ValidationError(_) => "validation_failed",
            AppError::MissingApiKey => "missing_api_key",
            AppError::InvalidApiKey => "invalid_api_key",
            AppError::InsufficientPermissions(_) => "insufficient_permissions",
            AppError::ForeignAccount => "forbidden",
            AppError::AccountNotFound => "account_not_found",
            AppError::AccountAlreadyExists => "account_exists",
            AppError::AccountInactive => "inactive_account",
            AppError::InvalidStatusTransition { .. } => "invalid_status_transition",
            AppError::ApiKeyNotFound => "api_key_not_found",
            AppError::IdempotencyKeyPending => "idempotency_key_pending",
            AppError::IdempotencyNotPending => "idempotency_not_pending",
            AppError::IdempotencyRecordNotFound => "idempotency_record_not_found",
            AppError::RateLimitExceeded => "rate_limit_exceeded",
            AppError::Serialization(_)
            | AppError::Configuration(_)
            | AppError::Cryptographic(_)
            | AppError::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Database(_)
            | AppError::DatabaseMigration(_)
            | AppError::Redis(_)
            | AppError::StoreTimeout(_)
            | AppError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InvalidPermission(_)
            | AppError::InvalidName(_)
            | AppError::InvalidExpiry(_)
            | AppError::InvalidPagination(_)
            | AppError::InvalidQuery(_)
            | AppError::InvalidRequest(_)
            | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::MissingApiKey | AppError::InvalidApiKey => StatusCode::UNAUTHORIZED,
            AppError::InsufficientPermissions(_)
            | AppError::ForeignAccount
            | AppError::AccountInactive => StatusCode::FORBIDDEN,
            AppError::AccountNotFound
            | AppError::ApiKeyNotFound
            | AppError::IdempotencyRecordNotFound => StatusCode::NOT_FOUND,
            AppError::AccountAlreadyExists
            | AppError::InvalidStatusTransition { .. }
            | AppError::IdempotencyKeyPending
            | AppError::IdempotencyNotPending => StatusCode::CONFLICT,
            AppError::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            AppError::Serialization(_)
            | AppError::Configuration(_)
            | AppError::Cryptographic(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True for failures of the backing stores rather than of the caller's input.
    pub fn is_infrastructure(&self) -> bool {
        self.status_code().is_server_error()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Storage engine and internal details stay in the server log.
        let message = if self.is_infrastructure() {
            tracing::error!(error = ?self, code = self.code(), "Request failed");
            match status {
                StatusCode::SERVICE_UNAVAILABLE => "Service temporarily unavailable".to_string(),
                _ => "Internal server error".to_string(),
            }
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": self.code(),
            "message": message,
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

/// Outcome of a fire-and-forget side effect.
///
/// Failures are logged where they happen and never propagated to the caller's
/// primary path, so there is nothing to `?` on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "best-effort outcomes are informational; bind to `_` to ignore"]
pub enum BestEffort {
    Accepted,
    Dropped,
}

impl BestEffort {
    pub fn is_accepted(self) -> bool {
        matches!(self, BestEffort::Accepted)
    }
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, AppError>;
