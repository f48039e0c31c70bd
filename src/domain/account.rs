use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::{AppError, Result};

pub const ACCOUNT_NAME_MIN_LEN: usize = 3;
pub const ACCOUNT_NAME_MAX_LEN: usize = 100;

/// A tenant of the platform. Only `active` accounts may authenticate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub name: String,
    pub status: AccountStatus,
    pub webhook_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(name: String, webhook_url: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            status: AccountStatus::Active,
            webhook_url,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Suspended,
    Deleted,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Suspended => "suspended",
            AccountStatus::Deleted => "deleted",
        }
    }

    /// Status only moves toward `deleted`, except reinstatement of a suspended account.
    pub fn can_transition_to(self, next: AccountStatus) -> bool {
        use AccountStatus::*;
        matches!(
            (self, next),
            (Active, Suspended) | (Suspended, Active) | (Active, Deleted) | (Suspended, Deleted)
        )
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(AccountStatus::Active),
            "suspended" => Ok(AccountStatus::Suspended),
            "deleted" => Ok(AccountStatus::Deleted),
            other => Err(AppError::Internal(format!("unknown account status `{other}`"))),
        }
    }
}

pub fn validate_account_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    let len = trimmed.chars().count();
    if !(ACCOUNT_NAME_MIN_LEN..=ACCOUNT_NAME_MAX_LEN).contains(&len) {
        return Err(AppError::InvalidName(format!(
            "account name must be between {ACCOUNT_NAME_MIN_LEN} and {ACCOUNT_NAME_MAX_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}

pub fn validate_webhook_url(url: &str) -> Result<String> {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| {
            AppError::ValidationError("webhook_url must be an http or https URL".to_string())
        })?;

    if rest.is_empty() || rest.starts_with('/') || url.chars().any(char::is_whitespace) {
        return Err(AppError::ValidationError(
            "webhook_url must include a host".to_string(),
        ));
    }
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use AccountStatus::*;
        assert!(Active.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Active));
        assert!(Suspended.can_transition_to(Deleted));
        assert!(!Deleted.can_transition_to(Active));
        assert!(!Deleted.can_transition_to(Suspended));
        assert!(!Active.can_transition_to(Active));
    }

    #[test]
    fn test_account_name_bounds() {
        assert!(validate_account_name("ab").is_err());
        assert_eq!(validate_account_name("  acme  ").unwrap(), "acme");
        assert!(validate_account_name(&"x".repeat(101)).is_err());
        assert!(validate_account_name(&"x".repeat(100)).is_ok());
    }

    #[test]
    fn test_webhook_url() {
        assert!(validate_webhook_url("https://hooks.example.com/pay").is_ok());
        assert!(validate_webhook_url("ftp://example.com").is_err());
        assert!(validate_webhook_url("https://").is_err());
        assert!(validate_webhook_url("https://exa mple.com").is_err());
    }
}
