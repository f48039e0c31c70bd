// Account queries

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::schema::AccountRow;
use crate::domain::{Account, AccountStatus};
use crate::errors::{AppError, Result};
use crate::store::AccountStore;

pub struct PostgresAccountStore {
    pool: PgPool,
}

impl PostgresAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for PostgresAccountStore {
    async fn insert(&self, account: &Account) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (id, name, status, webhook_url, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(account.id)
        .bind(&account.name)
        .bind(account.status.as_str())
        .bind(&account.webhook_url)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                AppError::AccountAlreadyExists
            }
            other => AppError::Database(other),
        })?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Account>> {
        let row: Option<AccountRow> = sqlx::query_as(
            r#"
            SELECT id, name, status, webhook_url, created_at, updated_at
            FROM accounts
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Account::try_from).transpose()
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: AccountStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE accounts SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .bind(updated_at)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::AccountNotFound);
        }

        tracing::debug!(account_id = %id, status = status.as_str(), "Updated account status");
        Ok(())
    }
}
