// Database row types and their conversion into domain types

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::{Account, ApiKey, AuditEvent, PermissionSet};
use crate::errors::{AppError, Result};

// ============================================================================
// Account
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct AccountRow {
    pub id: Uuid,
    pub name: String,
    pub status: String,
    pub webhook_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<AccountRow> for Account {
    type Error = AppError;

    fn try_from(row: AccountRow) -> Result<Self> {
        Ok(Account {
            id: row.id,
            name: row.name,
            status: row.status.parse()?,
            webhook_url: row.webhook_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

// ============================================================================
// API key
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct ApiKeyRow {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    pub storage_hash: String,
    pub lookup_hash: String,
    pub permissions: Vec<String>,
    pub status: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ApiKeyRow> for ApiKey {
    type Error = AppError;

    fn try_from(row: ApiKeyRow) -> Result<Self> {
        let permissions = PermissionSet::parse(&row.permissions).map_err(|e| {
            AppError::Internal(format!("api key {} has corrupt permissions: {}", row.id, e))
        })?;

        Ok(ApiKey {
            id: row.id,
            account_id: row.account_id,
            name: row.name,
            storage_hash: row.storage_hash,
            lookup_hash: row.lookup_hash,
            permissions,
            status: row.status.parse()?,
            last_used_at: row.last_used_at,
            expires_at: row.expires_at,
            created_at: row.created_at,
        })
    }
}

// ============================================================================
// Audit event
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct AuditEventRow {
    pub id: Uuid,
    pub partition_key: String,
    pub sort_key: String,
    pub category: String,
    pub occurred_at: DateTime<Utc>,
    pub account_id: Option<Uuid>,
    pub api_key_id: Option<Uuid>,
    pub key_name: Option<String>,
    pub source_ip: String,
    pub user_agent: String,
    pub success: bool,
    pub detail: serde_json::Value,
    pub expires_at: DateTime<Utc>,
    pub previous_hash: Option<String>,
    pub event_hash: String,
}

impl TryFrom<AuditEventRow> for AuditEvent {
    type Error = AppError;

    fn try_from(row: AuditEventRow) -> Result<Self> {
        let detail: BTreeMap<String, String> = serde_json::from_value(row.detail)?;
        Ok(AuditEvent {
            id: row.id,
            partition_key: row.partition_key,
            sort_key: row.sort_key,
            category: row.category.parse()?,
            occurred_at: row.occurred_at,
            account_id: row.account_id,
            api_key_id: row.api_key_id,
            key_name: row.key_name,
            source_ip: row.source_ip,
            user_agent: row.user_agent,
            success: row.success,
            detail,
            expires_at: row.expires_at,
            previous_hash: row.previous_hash,
            event_hash: row.event_hash,
        })
    }
}
