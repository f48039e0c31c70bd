//! In-process store implementations for development and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::{
    AccountStore, ApiKeyStore, AuditStore, IdempotencyStore, InsertOutcome, RateLimitStore,
    WindowCount,
};
use crate::domain::{
    Account, AccountStatus, ApiKey, ApiKeyStatus, AuditEvent, AuditQuery, CachedResponse,
    IdempotencyRecord, IdempotencyStatus,
};
use crate::errors::{AppError, Result};

#[derive(Debug, Clone, Default)]
pub struct InMemoryAccountStore {
    accounts: Arc<RwLock<HashMap<Uuid, Account>>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn insert(&self, account: &Account) -> Result<()> {
        let mut accounts = self.accounts.write().await;
        let taken = accounts
            .values()
            .any(|a| a.name.eq_ignore_ascii_case(&account.name));
        if taken || accounts.contains_key(&account.id) {
            return Err(AppError::AccountAlreadyExists);
        }
        accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Account>> {
        Ok(self.accounts.read().await.get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: AccountStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut accounts = self.accounts.write().await;
        let account = accounts.get_mut(&id).ok_or(AppError::AccountNotFound)?;
        account.status = status;
        account.updated_at = updated_at;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ApiKeyTables {
    rows: HashMap<Uuid, ApiKey>,
    by_lookup_hash: HashMap<String, Uuid>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryApiKeyStore {
    tables: Arc<RwLock<ApiKeyTables>>,
}

impl InMemoryApiKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApiKeyStore for InMemoryApiKeyStore {
    async fn insert(&self, key: &ApiKey) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.by_lookup_hash.contains_key(&key.lookup_hash) {
            return Err(AppError::Internal("duplicate lookup hash".to_string()));
        }
        tables.by_lookup_hash.insert(key.lookup_hash.clone(), key.id);
        tables.rows.insert(key.id, key.clone());
        Ok(())
    }

    async fn get(&self, key_id: Uuid) -> Result<Option<ApiKey>> {
        Ok(self.tables.read().await.rows.get(&key_id).cloned())
    }

    async fn find_by_lookup_hash(&self, lookup_hash: &str) -> Result<Option<ApiKey>> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_lookup_hash
            .get(lookup_hash)
            .and_then(|id| tables.rows.get(id))
            .cloned())
    }

    async fn deactivate(&self, key_id: Uuid) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.rows.get_mut(&key_id) {
            Some(key) if key.status == ApiKeyStatus::Active => {
                key.status = ApiKeyStatus::Inactive;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(AppError::ApiKeyNotFound),
        }
    }

    async fn touch_last_used(&self, key_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        if let Some(key) = self.tables.write().await.rows.get_mut(&key_id) {
            key.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn list(&self, account_id: Uuid, limit: u32, offset: u32) -> Result<(Vec<ApiKey>, u64)> {
        let tables = self.tables.read().await;
        let mut keys: Vec<&ApiKey> = tables
            .rows
            .values()
            .filter(|k| k.account_id == account_id)
            .collect();
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let total = keys.len() as u64;
        let page = keys
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let expired: Vec<(Uuid, String)> = tables
            .rows
            .values()
            .filter(|k| k.expires_at < cutoff)
            .map(|k| (k.id, k.lookup_hash.clone()))
            .collect();
        for (id, lookup_hash) in &expired {
            tables.rows.remove(id);
            tables.by_lookup_hash.remove(lookup_hash);
        }
        Ok(expired.len() as u64)
    }
}

#[derive(Debug, Default)]
struct IdempotencyTables {
    by_fingerprint: HashMap<String, IdempotencyRecord>,
    fingerprint_by_id: HashMap<Uuid, String>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryIdempotencyStore {
    tables: Arc<Mutex<IdempotencyTables>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, fingerprint: &str) -> Result<Option<IdempotencyRecord>> {
        Ok(self.tables.lock().await.by_fingerprint.get(fingerprint).cloned())
    }

    async fn insert_if_absent(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables.by_fingerprint.get(&record.fingerprint) {
            if !existing.is_expired_at(now) {
                return Ok(InsertOutcome::Exists(existing.clone()));
            }
            let stale_id = existing.id;
            tables.fingerprint_by_id.remove(&stale_id);
        }
        tables
            .fingerprint_by_id
            .insert(record.id, record.fingerprint.clone());
        tables
            .by_fingerprint
            .insert(record.fingerprint.clone(), record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn complete(&self, record_id: Uuid, response: &CachedResponse) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let fingerprint = tables
            .fingerprint_by_id
            .get(&record_id)
            .cloned()
            .ok_or(AppError::IdempotencyRecordNotFound)?;
        let record = tables
            .by_fingerprint
            .get_mut(&fingerprint)
            .ok_or(AppError::IdempotencyRecordNotFound)?;
        if record.status != IdempotencyStatus::Pending {
            return Err(AppError::IdempotencyNotPending);
        }
        record.status = IdempotencyStatus::Completed;
        record.response = Some(response.clone());
        Ok(())
    }

    async fn abandon(&self, record_id: Uuid) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let Some(fingerprint) = tables.fingerprint_by_id.get(&record_id).cloned() else {
            return Ok(());
        };
        let pending = tables
            .by_fingerprint
            .get(&fingerprint)
            .is_some_and(|r| r.id == record_id && r.status == IdempotencyStatus::Pending);
        if pending {
            tables.by_fingerprint.remove(&fingerprint);
            tables.fingerprint_by_id.remove(&record_id);
        }
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let expired: Vec<(String, Uuid)> = tables
            .by_fingerprint
            .values()
            .filter(|r| r.is_expired_at(now))
            .map(|r| (r.fingerprint.clone(), r.id))
            .collect();
        for (fingerprint, id) in &expired {
            tables.by_fingerprint.remove(fingerprint);
            tables.fingerprint_by_id.remove(id);
        }
        Ok(expired.len() as u64)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryRateLimitStore {
    counters: Arc<Mutex<HashMap<String, WindowCount>>>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn increment(
        &self,
        key: &str,
        window: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<WindowCount> {
        let mut counters = self.counters.lock().await;
        let counter = counters
            .entry(key.to_string())
            .and_modify(|c| {
                if now >= c.reset_at {
                    *c = WindowCount {
                        count: 0,
                        reset_at: now + window,
                    };
                }
            })
            .or_insert(WindowCount {
                count: 0,
                reset_at: now + window,
            });
        counter.count += 1;
        Ok(*counter)
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.counters.lock().await.remove(key);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct AuditTables {
    /// partition key -> sort key -> event
    partitions: HashMap<String, BTreeMap<String, AuditEvent>>,
    /// account id -> (sort key, partition key)
    by_account: HashMap<Uuid, BTreeSet<(String, String)>>,
    head_hash: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryAuditStore {
    tables: Arc<RwLock<AuditTables>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored event in sort-key order.
    pub async fn all_events(&self) -> Vec<AuditEvent> {
        let tables = self.tables.read().await;
        let mut events: Vec<AuditEvent> = tables
            .partitions
            .values()
            .flat_map(|p| p.values().cloned())
            .collect();
        events.sort_by(|a, b| a.sort_key.cmp(&b.sort_key));
        events
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, events: &[AuditEvent]) -> Result<()> {
        let mut tables = self.tables.write().await;
        for event in events {
            tables
                .partitions
                .entry(event.partition_key.clone())
                .or_default()
                .insert(event.sort_key.clone(), event.clone());
            if let Some(account_id) = event.account_id {
                tables
                    .by_account
                    .entry(account_id)
                    .or_default()
                    .insert((event.sort_key.clone(), event.partition_key.clone()));
            }
            tables.head_hash = Some(event.event_hash.clone());
        }
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let tables = self.tables.read().await;

        let mut events: Vec<AuditEvent> = match query.account_id {
            Some(account_id) => tables
                .by_account
                .get(&account_id)
                .into_iter()
                .flatten()
                .filter_map(|(sort, partition)| tables.partitions.get(partition)?.get(sort))
                .filter(|e| query.matches(e))
                .take(query.limit)
                .cloned()
                .collect(),
            None => query
                .partitions()
                .iter()
                .filter_map(|p| tables.partitions.get(p))
                .flat_map(|p| p.values())
                .filter(|e| query.matches(e))
                .take(query.limit)
                .cloned()
                .collect(),
        };
        events.sort_by(|a, b| a.sort_key.cmp(&b.sort_key));
        Ok(events)
    }

    async fn latest_hash(&self) -> Result<Option<String>> {
        Ok(self.tables.read().await.head_hash.clone())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let mut purged = Vec::new();
        for partition in tables.partitions.values_mut() {
            partition.retain(|_, e| {
                let keep = e.expires_at > now;
                if !keep {
                    purged.push((e.account_id, e.sort_key.clone(), e.partition_key.clone()));
                }
                keep
            });
        }
        tables.partitions.retain(|_, p| !p.is_empty());
        for (account_id, sort, partition) in &purged {
            if let Some(index) = account_id.and_then(|id| tables.by_account.get_mut(&id)) {
                index.remove(&(sort.clone(), partition.clone()));
            }
        }
        Ok(purged.len() as u64)
    }
}
