//! Tenant registration and lifecycle.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::audit::AuditRecorder;
use crate::auth::{ApiKeyRegistry, IssueRequest, IssuedKey};
use crate::clock::Clock;
use crate::domain::account::{validate_account_name, validate_webhook_url};
use crate::domain::{Account, AccountStatus, AuditCategory, PermissionSet, RequestContext};
use crate::errors::{AppError, Result};
use crate::store::{with_deadline, AccountStore};

pub const BOOTSTRAP_KEY_NAME: &str = "bootstrap";

#[derive(Debug, Clone)]
pub struct RegisterAccount {
    pub name: String,
    pub webhook_url: Option<String>,
}

/// A new account together with the first key minted for it.
#[derive(Debug, Clone)]
pub struct Registration {
    pub account: Account,
    pub bootstrap_key: IssuedKey,
}

#[derive(Clone)]
pub struct AccountService {
    accounts: Arc<dyn AccountStore>,
    registry: ApiKeyRegistry,
    audit: AuditRecorder,
    clock: Arc<dyn Clock>,
    deadline: Duration,
}

impl AccountService {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        registry: ApiKeyRegistry,
        audit: AuditRecorder,
        clock: Arc<dyn Clock>,
        deadline: Duration,
    ) -> Self {
        Self {
            accounts,
            registry,
            audit,
            clock,
            deadline,
        }
    }

    /// Creates an active account and issues it one key holding every permission.
    pub async fn register(
        &self,
        request: RegisterAccount,
        context: &RequestContext,
    ) -> Result<Registration> {
        let name = validate_account_name(&request.name)?;
        let webhook_url = request
            .webhook_url
            .as_deref()
            .map(validate_webhook_url)
            .transpose()?;

        let account = Account::new(name, webhook_url, self.clock.now());
        with_deadline(self.deadline, "account_insert", self.accounts.insert(&account)).await?;

        let _ = self.audit.record(
            self.audit
                .entry(AuditCategory::AccountCreated, context)
                .with_account(account.id)
                .with_detail("name", account.name.clone()),
        );
        info!(account_id = %account.id, "Account registered");

        let bootstrap_key = self
            .registry
            .issue(
                IssueRequest {
                    account_id: account.id,
                    name: BOOTSTRAP_KEY_NAME.to_string(),
                    permissions: PermissionSet::all(),
                    ttl: None,
                },
                context,
            )
            .await?;

        Ok(Registration {
            account,
            bootstrap_key,
        })
    }

    pub async fn get(&self, account_id: Uuid) -> Result<Account> {
        with_deadline(self.deadline, "account_get", self.accounts.get(account_id))
            .await?
            .ok_or(AppError::AccountNotFound)
    }

    /// Moves an account along its lifecycle. Keys of a non-active account stop
    /// validating immediately; they are not revoked.
    pub async fn set_status(&self, account_id: Uuid, next: AccountStatus) -> Result<Account> {
        let mut account = self.get(account_id).await?;
        if account.status == next {
            return Ok(account);
        }
        if !account.status.can_transition_to(next) {
            return Err(AppError::InvalidStatusTransition {
                from: account.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = self.clock.now();
        with_deadline(
            self.deadline,
            "account_update_status",
            self.accounts.update_status(account_id, next, now),
        )
        .await?;

        info!(account_id = %account_id, from = %account.status, to = %next, "Account status changed");
        account.status = next;
        account.updated_at = now;
        Ok(account)
    }
}
