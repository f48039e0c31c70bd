use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::AuditRecorder;
use crate::auth::key_material::{self, GeneratedKey, KeyMaterialManager};
use crate::clock::Clock;
use crate::config::ApiKeyConfig;
use crate::domain::api_key::validate_key_name;
use crate::domain::{
    ApiKey, ApiKeyStatus, AuditCategory, InvalidReason, KeyValidation, PermissionSet, RawSecret,
    RequestContext,
};
use crate::errors::{AppError, BestEffort, Result};
use crate::observability::MetricsRecorder;
use crate::store::{with_deadline, AccountStore, ApiKeyStore};

pub const LIST_MAX_LIMIT: u32 = 100;

#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub account_id: Uuid,
    pub name: String,
    pub permissions: PermissionSet,
    /// `None` falls back to the configured default lifetime.
    pub ttl: Option<ChronoDuration>,
}

/// Result of issuance. `raw_secret` exists only here and is never persisted.
#[derive(Debug, Clone)]
pub struct IssuedKey {
    pub raw_secret: RawSecret,
    pub key: ApiKey,
}

#[derive(Debug, Clone)]
pub struct ApiKeyPage {
    pub keys: Vec<ApiKey>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

/// Lifecycle store for issued keys.
#[derive(Clone)]
pub struct ApiKeyRegistry {
    keys: Arc<dyn ApiKeyStore>,
    accounts: Arc<dyn AccountStore>,
    material: KeyMaterialManager,
    audit: AuditRecorder,
    clock: Arc<dyn Clock>,
    config: ApiKeyConfig,
    deadline: Duration,
}

impl ApiKeyRegistry {
    pub fn new(
        keys: Arc<dyn ApiKeyStore>,
        accounts: Arc<dyn AccountStore>,
        material: KeyMaterialManager,
        audit: AuditRecorder,
        clock: Arc<dyn Clock>,
        config: ApiKeyConfig,
        deadline: Duration,
    ) -> Self {
        Self {
            keys,
            accounts,
            material,
            audit,
            clock,
            config,
            deadline,
        }
    }

    /// Mints a key for an active account and returns its raw secret once.
    pub async fn issue(&self, request: IssueRequest, context: &RequestContext) -> Result<IssuedKey> {
        let name = validate_key_name(&request.name)?;
        let ttl = self.resolve_ttl(request.ttl)?;

        let account = with_deadline(self.deadline, "account_get", self.accounts.get(request.account_id))
            .await?
            .ok_or(AppError::AccountNotFound)?;
        if !account.is_active() {
            return Err(AppError::AccountInactive);
        }

        let GeneratedKey {
            raw,
            storage_hash,
            lookup_hash,
        } = self.generate_material().await?;

        let now = self.clock.now();
        let key = ApiKey {
            id: Uuid::new_v4(),
            account_id: account.id,
            name,
            storage_hash,
            lookup_hash,
            permissions: request.permissions,
            status: ApiKeyStatus::Active,
            last_used_at: None,
            expires_at: now + ttl,
            created_at: now,
        };

        with_deadline(self.deadline, "api_key_insert", self.keys.insert(&key)).await?;

        let _ = self.audit.record(
            self.audit
                .entry(AuditCategory::KeyIssued, context)
                .with_account(key.account_id)
                .with_key(key.id, key.name.clone())
                .with_detail("permissions", key.permissions.to_strings().join(","))
                .with_detail("expires_at", key.expires_at.to_rfc3339()),
        );
        MetricsRecorder::record_key_issued();
        info!(
            account_id = %key.account_id,
            key_id = %key.id,
            expires_at = %key.expires_at,
            "API key issued"
        );

        Ok(IssuedKey {
            raw_secret: raw,
            key,
        })
    }

    /// Resolves a raw secret to its key and decides whether it may be used now.
    ///
    /// Every authentication failure is `Ok` with `valid == false`; `Err` means a
    /// backing store could not answer and the caller must fail closed.
    pub async fn validate_by_raw_secret(&self, raw: &str) -> Result<KeyValidation> {
        if !key_material::is_well_formed(raw) {
            return Ok(KeyValidation::invalid(None, InvalidReason::Malformed));
        }

        let lookup_hash = key_material::lookup_hash(raw);
        let found = with_deadline(
            self.deadline,
            "api_key_lookup",
            self.keys.find_by_lookup_hash(&lookup_hash),
        )
        .await?;

        let Some(key) = found else {
            return Ok(KeyValidation::invalid(None, InvalidReason::NotFound));
        };

        if !key_material::constant_time_eq(&key.lookup_hash, &lookup_hash)
            || !self.verify_material(raw, &key.storage_hash).await?
        {
            warn!(key_id = %key.id, "Lookup hash matched but storage hash did not");
            return Ok(KeyValidation::invalid(Some(key), InvalidReason::HashMismatch));
        }

        if key.status != ApiKeyStatus::Active {
            return Ok(KeyValidation::invalid(Some(key), InvalidReason::Revoked));
        }

        let now = self.clock.now();
        if key.is_expired_at(now) {
            return Ok(KeyValidation::invalid(Some(key), InvalidReason::Expired));
        }

        let account = with_deadline(self.deadline, "account_get", self.accounts.get(key.account_id)).await?;
        if !account.is_some_and(|a| a.is_active()) {
            return Ok(KeyValidation::invalid(Some(key), InvalidReason::AccountInactive));
        }

        let _ = self.touch_last_used(key.id);
        Ok(KeyValidation::valid(key))
    }

    /// Deactivates a key. Revoking an inactive key is a silent success.
    pub async fn revoke(&self, key_id: Uuid, context: &RequestContext) -> Result<()> {
        let key = self.get(key_id).await?;

        let changed = with_deadline(self.deadline, "api_key_deactivate", self.keys.deactivate(key_id)).await?;
        if !changed {
            debug!(key_id = %key_id, "API key already inactive");
            return Ok(());
        }

        let _ = self.audit.record(
            self.audit
                .entry(AuditCategory::KeyRevoked, context)
                .with_account(key.account_id)
                .with_key(key.id, key.name.clone()),
        );
        MetricsRecorder::record_key_revoked();
        info!(account_id = %key.account_id, key_id = %key.id, "API key revoked");

        Ok(())
    }

    pub async fn get(&self, key_id: Uuid) -> Result<ApiKey> {
        with_deadline(self.deadline, "api_key_get", self.keys.get(key_id))
            .await?
            .ok_or(AppError::ApiKeyNotFound)
    }

    /// Page of one account's keys, newest first.
    pub async fn list(&self, account_id: Uuid, limit: u32, offset: u32) -> Result<ApiKeyPage> {
        if !(1..=LIST_MAX_LIMIT).contains(&limit) {
            return Err(AppError::InvalidPagination(format!(
                "limit must be between 1 and {}",
                LIST_MAX_LIMIT
            )));
        }

        with_deadline(self.deadline, "account_get", self.accounts.get(account_id))
            .await?
            .ok_or(AppError::AccountNotFound)?;

        let (keys, total) =
            with_deadline(self.deadline, "api_key_list", self.keys.list(account_id, limit, offset)).await?;

        Ok(ApiKeyPage {
            keys,
            total,
            limit,
            offset,
        })
    }

    /// Deletes keys that expired longer ago than the retention grace period.
    pub async fn purge_expired(&self) -> Result<u64> {
        let cutoff = self.clock.now() - ChronoDuration::days(self.config.expired_key_retention_days);
        with_deadline(self.deadline, "api_key_purge", self.keys.purge_expired(cutoff)).await
    }

    fn resolve_ttl(&self, ttl: Option<ChronoDuration>) -> Result<ChronoDuration> {
        let max = ChronoDuration::hours(self.config.max_ttl_hours);
        match ttl {
            None => Ok(ChronoDuration::hours(self.config.default_ttl_hours)),
            Some(ttl) if ttl <= ChronoDuration::zero() => {
                Err(AppError::InvalidExpiry("ttl must be positive".to_string()))
            }
            Some(ttl) if ttl > max => Err(AppError::InvalidExpiry(format!(
                "ttl must not exceed {} hours",
                self.config.max_ttl_hours
            ))),
            Some(ttl) => Ok(ttl),
        }
    }

    /// Refreshes `last_used_at` in the background; failure only logs.
    fn touch_last_used(&self, key_id: Uuid) -> BestEffort {
        let keys = self.keys.clone();
        let at = self.clock.now();
        let deadline = self.deadline;
        tokio::spawn(async move {
            if let Err(e) =
                with_deadline(deadline, "api_key_touch", keys.touch_last_used(key_id, at)).await
            {
                warn!(key_id = %key_id, error = %e, "Failed to refresh last_used_at");
            }
        });
        BestEffort::Accepted
    }

    // Argon2 is deliberately slow; keep it off the async workers.
    async fn generate_material(&self) -> Result<GeneratedKey> {
        let material = self.material.clone();
        tokio::task::spawn_blocking(move || material.generate())
            .await
            .map_err(|e| AppError::Internal(format!("key generation task failed: {}", e)))?
    }

    async fn verify_material(&self, raw: &str, storage_hash: &str) -> Result<bool> {
        let material = self.material.clone();
        let (raw, storage_hash) = (raw.to_string(), storage_hash.to_string());
        tokio::task::spawn_blocking(move || material.verify(&raw, &storage_hash))
            .await
            .map_err(|e| AppError::Internal(format!("key verification task failed: {}", e)))?
    }
}
