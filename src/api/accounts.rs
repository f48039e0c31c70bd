// Account registration endpoint

use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::accounts::RegisterAccount;
use crate::api::api_keys::IssuedKeyResponse;
use crate::api::extract::JsonBody;
use crate::api::routes::AppState;
use crate::domain::{Account, AccountStatus, RequestContext};
use crate::errors::Result;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RegisterAccountRequest {
    pub name: String,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub account_id: Uuid,
    pub name: String,
    pub status: AccountStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<Account> for AccountResponse {
    fn from(account: Account) -> Self {
        Self {
            account_id: account.id,
            name: account.name,
            status: account.status,
            webhook_url: account.webhook_url,
            created_at: account.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RegisterAccountResponse {
    pub account: AccountResponse,
    /// The bootstrap key. Its secret is shown only in this response.
    pub api_key: IssuedKeyResponse,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /v1/accounts
#[tracing::instrument(skip_all)]
pub async fn register(
    State(state): State<AppState>,
    context: RequestContext,
    JsonBody(request): JsonBody<RegisterAccountRequest>,
) -> Result<(StatusCode, Json<RegisterAccountResponse>)> {
    let registration = state
        .accounts
        .register(
            RegisterAccount {
                name: request.name,
                webhook_url: request.webhook_url,
            },
            &context,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterAccountResponse {
            account: registration.account.into(),
            api_key: registration.bootstrap_key.into(),
        }),
    ))
}
