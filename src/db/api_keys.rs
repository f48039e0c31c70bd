// API key queries

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::schema::ApiKeyRow;
use crate::domain::ApiKey;
use crate::errors::{AppError, Result};
use crate::store::ApiKeyStore;

const API_KEY_COLUMNS: &str = "id, account_id, name, storage_hash, lookup_hash, permissions, \
     status, last_used_at, expires_at, created_at";

/// API keys addressable by id and, through `idx_api_keys_lookup_hash`, by lookup hash.
pub struct PostgresApiKeyStore {
    pool: PgPool,
}

impl PostgresApiKeyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApiKeyStore for PostgresApiKeyStore {
    async fn insert(&self, key: &ApiKey) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO api_keys (
                id, account_id, name, storage_hash, lookup_hash, permissions,
                status, last_used_at, expires_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(key.id)
        .bind(key.account_id)
        .bind(&key.name)
        .bind(&key.storage_hash)
        .bind(&key.lookup_hash)
        .bind(key.permissions.to_strings())
        .bind(key.status.as_str())
        .bind(key.last_used_at)
        .bind(key.expires_at)
        .bind(key.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, key_id: Uuid) -> Result<Option<ApiKey>> {
        let row: Option<ApiKeyRow> =
            sqlx::query_as(&format!("SELECT {API_KEY_COLUMNS} FROM api_keys WHERE id = $1"))
                .bind(key_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(ApiKey::try_from).transpose()
    }

    async fn find_by_lookup_hash(&self, lookup_hash: &str) -> Result<Option<ApiKey>> {
        let row: Option<ApiKeyRow> = sqlx::query_as(&format!(
            "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE lookup_hash = $1"
        ))
        .bind(lookup_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ApiKey::try_from).transpose()
    }

    async fn deactivate(&self, key_id: Uuid) -> Result<bool> {
        // Single conditional UPDATE so concurrent revokes agree on who flipped it.
        let changed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE api_keys SET status = 'inactive'
            WHERE id = $1 AND status = 'active'
            RETURNING id
            "#,
        )
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await?;

        if changed.is_some() {
            return Ok(true);
        }

        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM api_keys WHERE id = $1")
            .bind(key_id)
            .fetch_optional(&self.pool)
            .await?;

        match exists {
            Some(_) => Ok(false),
            None => Err(AppError::ApiKeyNotFound),
        }
    }

    async fn touch_last_used(&self, key_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE api_keys SET last_used_at = $2
            WHERE id = $1 AND (last_used_at IS NULL OR last_used_at < $2)
            "#,
        )
        .bind(key_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list(&self, account_id: Uuid, limit: u32, offset: u32) -> Result<(Vec<ApiKey>, u64)> {
        let rows: Vec<ApiKeyRow> = sqlx::query_as(&format!(
            "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE account_id = $1 \
             ORDER BY created_at DESC, id LIMIT $2 OFFSET $3"
        ))
        .bind(account_id)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM api_keys WHERE account_id = $1")
            .bind(account_id)
            .fetch_one(&self.pool)
            .await?;

        let keys = rows
            .into_iter()
            .map(ApiKey::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok((keys, total.max(0) as u64))
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM api_keys WHERE expires_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
