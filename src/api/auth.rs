// Credential validation endpoint for other platform services

use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::extract::JsonBody;
use crate::api::routes::AppState;
use crate::domain::{AccountStatus, RequestContext};
use crate::errors::Result;

#[derive(Debug, Deserialize)]
pub struct ValidateApiKeyRequest {
    #[serde(default)]
    pub api_key: String,
}

/// Identity fields are present whenever the secret resolved to a stored key,
/// even when `valid` is false.
#[derive(Debug, Default, Serialize)]
pub struct ValidateApiKeyResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_status: Option<AccountStatus>,
}

/// POST /v1/auth/validate
///
/// An invalid key is a 200 with `valid: false`; only a store outage is an error.
#[tracing::instrument(skip_all)]
pub async fn validate(
    State(state): State<AppState>,
    context: RequestContext,
    JsonBody(request): JsonBody<ValidateApiKeyRequest>,
) -> Result<Json<ValidateApiKeyResponse>> {
    let raw = request.api_key.trim();
    let raw = (!raw.is_empty()).then_some(raw);

    let validation = state.authenticator.authenticate(raw, &context).await?;

    let mut response = ValidateApiKeyResponse {
        valid: validation.is_valid(),
        reason: validation.reason().map(|r| r.as_str()),
        ..Default::default()
    };

    if let Some(key) = validation.key {
        // Account details are informational; a lookup failure leaves them out.
        if let Ok(account) = state.accounts.get(key.account_id).await {
            response.account_name = Some(account.name);
            response.account_status = Some(account.status);
        }
        response.account_id = Some(key.account_id);
        response.api_key_id = Some(key.id);
        response.name = Some(key.name);
        response.permissions = Some(key.permissions.to_strings());
        response.last_used_at = key.last_used_at;
        response.expires_at = Some(key.expires_at);
    }

    Ok(Json(response))
}
