// API key issuance, listing and revocation endpoints

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::extract::JsonBody;
use crate::api::routes::AppState;
use crate::auth::{ApiKeyPage, IssueRequest, IssuedKey, ValidatedIdentity};
use crate::domain::{ApiKey, ApiKeyStatus, Permission, PermissionSet, RequestContext};
use crate::errors::{AppError, Result};

pub const EXPIRES_IN_HOURS_MAX: i64 = 8_760;
pub const DEFAULT_PAGE_LIMIT: u32 = 20;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub name: String,
    pub permissions: Vec<String>,
    #[serde(default, alias = "expires_in")]
    pub expires_in_hours: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ListApiKeysParams {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Stored key as shown to its owner. Hashes never leave the service.
#[derive(Debug, Serialize)]
pub struct ApiKeyResponse {
    pub api_key_id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    pub permissions: Vec<String>,
    pub status: ApiKeyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl From<ApiKey> for ApiKeyResponse {
    fn from(key: ApiKey) -> Self {
        Self {
            api_key_id: key.id,
            account_id: key.account_id,
            name: key.name,
            permissions: key.permissions.to_strings(),
            status: key.status,
            last_used_at: key.last_used_at,
            expires_at: key.expires_at,
            created_at: key.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct IssuedKeyResponse {
    /// The raw secret. Returned once and never retrievable again.
    pub api_key: String,
    #[serde(flatten)]
    pub key: ApiKeyResponse,
}

impl From<IssuedKey> for IssuedKeyResponse {
    fn from(issued: IssuedKey) -> Self {
        Self {
            api_key: issued.raw_secret.into_inner(),
            key: issued.key.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListApiKeysResponse {
    pub api_keys: Vec<ApiKeyResponse>,
    pub limit: u32,
    pub offset: u32,
    pub total: u64,
}

impl From<ApiKeyPage> for ListApiKeysResponse {
    fn from(page: ApiKeyPage) -> Self {
        Self {
            api_keys: page.keys.into_iter().map(Into::into).collect(),
            limit: page.limit,
            offset: page.offset,
            total: page.total,
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /v1/api-keys
///
/// Issues a key for the caller's own account.
#[tracing::instrument(skip_all, fields(account_id = %identity.account_id))]
pub async fn issue(
    State(state): State<AppState>,
    Extension(identity): Extension<ValidatedIdentity>,
    context: RequestContext,
    JsonBody(request): JsonBody<CreateApiKeyRequest>,
) -> Result<(StatusCode, Json<IssuedKeyResponse>)> {
    identity.require(Permission::WriteKeys)?;

    let permissions = PermissionSet::parse(&request.permissions)?;
    let ttl = request
        .expires_in_hours
        .map(|hours| {
            if (1..=EXPIRES_IN_HOURS_MAX).contains(&hours) {
                Ok(Duration::hours(hours))
            } else {
                Err(AppError::InvalidExpiry(format!(
                    "expires_in_hours must be between 1 and {}",
                    EXPIRES_IN_HOURS_MAX
                )))
            }
        })
        .transpose()?;

    let issued = state
        .registry
        .issue(
            IssueRequest {
                account_id: identity.account_id,
                name: request.name,
                permissions,
                ttl,
            },
            &context,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(issued.into())))
}

/// GET /v1/accounts/:account_id/api-keys
#[tracing::instrument(skip_all, fields(account_id = %identity.account_id))]
pub async fn list(
    State(state): State<AppState>,
    Extension(identity): Extension<ValidatedIdentity>,
    Path(account_id): Path<String>,
    params: std::result::Result<Query<ListApiKeysParams>, QueryRejection>,
) -> Result<Json<ListApiKeysResponse>> {
    identity.require(Permission::ReadKeys)?;

    let account_id = parse_id(&account_id, "account_id")?;
    if account_id != identity.account_id {
        return Err(AppError::ForeignAccount);
    }

    let Query(params) =
        params.map_err(|rejection| AppError::InvalidPagination(rejection.body_text()))?;
    let page = state
        .registry
        .list(
            account_id,
            params.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
            params.offset.unwrap_or(0),
        )
        .await?;

    Ok(Json(page.into()))
}

/// DELETE /v1/api-keys/:key_id
///
/// Revoking an already revoked key succeeds. Keys of other accounts read as
/// not found.
#[tracing::instrument(skip_all, fields(account_id = %identity.account_id))]
pub async fn revoke(
    State(state): State<AppState>,
    Extension(identity): Extension<ValidatedIdentity>,
    context: RequestContext,
    Path(key_id): Path<String>,
) -> Result<StatusCode> {
    identity.require(Permission::WriteKeys)?;

    let key_id = parse_id(&key_id, "key_id")?;
    let key = state.registry.get(key_id).await?;
    if key.account_id != identity.account_id {
        return Err(AppError::ApiKeyNotFound);
    }

    state.registry.revoke(key_id, &context).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_id(raw: &str, field: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| AppError::InvalidRequest(format!("{} must be a UUID", field)))
}
