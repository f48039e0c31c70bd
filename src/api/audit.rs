// Audit history endpoint

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    Extension, Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::api::routes::AppState;
use crate::auth::ValidatedIdentity;
use crate::clock::Clock;
use crate::domain::{AuditCategory, AuditEvent, AuditQuery, Permission};
use crate::errors::{AppError, Result};

pub const DEFAULT_EVENT_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct AuditEventsParams {
    pub category: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct AuditEventsResponse {
    pub events: Vec<AuditEvent>,
    pub count: usize,
}

/// GET /v1/audit/events
///
/// The caller's own account history, oldest first. Defaults to the last 24 hours.
#[tracing::instrument(skip_all, fields(account_id = %identity.account_id))]
pub async fn query_events(
    State(state): State<AppState>,
    Extension(identity): Extension<ValidatedIdentity>,
    params: std::result::Result<Query<AuditEventsParams>, QueryRejection>,
) -> Result<Json<AuditEventsResponse>> {
    identity.require(Permission::ReadAccounts)?;

    let Query(params) = params.map_err(|rejection| AppError::InvalidQuery(rejection.body_text()))?;
    let category = params
        .category
        .as_deref()
        .map(str::parse::<AuditCategory>)
        .transpose()?;
    let to = params.to.unwrap_or_else(|| state.clock.now());
    let from = params.from.unwrap_or(to - Duration::hours(24));

    let events = state
        .audit
        .query(&AuditQuery {
            category,
            account_id: Some(identity.account_id),
            from,
            to,
            limit: params.limit.unwrap_or(DEFAULT_EVENT_LIMIT),
        })
        .await?;

    Ok(Json(AuditEventsResponse {
        count: events.len(),
        events,
    }))
}
