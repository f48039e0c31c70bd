use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::{AppError, Result};

pub const KEY_NAME_MIN_LEN: usize = 3;
pub const KEY_NAME_MAX_LEN: usize = 100;

/// Capability granted by an API key. The set of variants is the allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum Permission {
    ReadAccounts,
    WriteAccounts,
    ReadKeys,
    WriteKeys,
    ManageWebhooks,
}

impl Permission {
    pub const ALL: [Permission; 5] = [
        Permission::ReadAccounts,
        Permission::WriteAccounts,
        Permission::ReadKeys,
        Permission::WriteKeys,
        Permission::ManageWebhooks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::ReadAccounts => "read:accounts",
            Permission::WriteAccounts => "write:accounts",
            Permission::ReadKeys => "read:keys",
            Permission::WriteKeys => "write:keys",
            Permission::ManageWebhooks => "manage:webhooks",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Permission::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| AppError::InvalidPermission(s.to_string()))
    }
}

impl TryFrom<String> for Permission {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Permission> for &'static str {
    fn from(p: Permission) -> Self {
        p.as_str()
    }
}

/// Non-empty set of permissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Permission>", into = "Vec<Permission>")]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    pub fn new(permissions: impl IntoIterator<Item = Permission>) -> Result<Self> {
        let set: BTreeSet<Permission> = permissions.into_iter().collect();
        if set.is_empty() {
            return Err(AppError::InvalidPermission(
                "at least one permission is required".to_string(),
            ));
        }
        Ok(Self(set))
    }

    pub fn all() -> Self {
        Self(Permission::ALL.into_iter().collect())
    }

    /// Parses raw strings, rejecting the first one outside the allow-list.
    pub fn parse<S: AsRef<str>>(raw: &[S]) -> Result<Self> {
        let permissions = raw
            .iter()
            .map(|s| s.as_ref().parse::<Permission>())
            .collect::<Result<Vec<_>>>()?;
        Self::new(permissions)
    }

    pub fn contains(&self, permission: Permission) -> bool {
        self.0.contains(&permission)
    }

    pub fn iter(&self) -> impl Iterator<Item = Permission> + '_ {
        self.0.iter().copied()
    }

    pub fn to_strings(&self) -> Vec<String> {
        self.iter().map(|p| p.as_str().to_string()).collect()
    }
}

impl TryFrom<Vec<Permission>> for PermissionSet {
    type Error = AppError;

    fn try_from(value: Vec<Permission>) -> Result<Self> {
        Self::new(value)
    }
}

impl From<PermissionSet> for Vec<Permission> {
    fn from(set: PermissionSet) -> Self {
        set.0.into_iter().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyStatus {
    Active,
    Inactive,
}

impl ApiKeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiKeyStatus::Active => "active",
            ApiKeyStatus::Inactive => "inactive",
        }
    }
}

impl FromStr for ApiKeyStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(ApiKeyStatus::Active),
            "inactive" => Ok(ApiKeyStatus::Inactive),
            other => Err(AppError::Internal(format!("unknown api key status `{other}`"))),
        }
    }
}

/// Persisted form of an issued key. The raw secret is never part of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKey {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    /// Salted Argon2id PHC string. Proves possession; never used to find the row.
    pub storage_hash: String,
    /// Hex SHA-256 of the raw secret. Index value for O(1) lookup; not a proof on its own.
    pub lookup_hash: String,
    pub permissions: PermissionSet,
    pub status: ApiKeyStatus,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Raw secret handed to the caller exactly once. Redacted in `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct RawSecret(String);

impl RawSecret {
    pub fn new(secret: String) -> Self {
        Self(secret)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for RawSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RawSecret(***)")
    }
}

pub fn validate_key_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    let len = trimmed.chars().count();
    if !(KEY_NAME_MIN_LEN..=KEY_NAME_MAX_LEN).contains(&len) {
        return Err(AppError::InvalidName(format!(
            "key name must be between {KEY_NAME_MIN_LEN} and {KEY_NAME_MAX_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// Why a presented secret did not authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    Missing,
    Malformed,
    NotFound,
    HashMismatch,
    Revoked,
    Expired,
    AccountInactive,
}

impl InvalidReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidReason::Missing => "missing_api_key",
            InvalidReason::Malformed => "malformed_api_key",
            InvalidReason::NotFound => "unknown_api_key",
            InvalidReason::HashMismatch => "hash_mismatch",
            InvalidReason::Revoked => "inactive_api_key",
            InvalidReason::Expired => "expired_api_key",
            InvalidReason::AccountInactive => "inactive_account",
        }
    }
}

/// Outcome of validating a raw secret. Authentication failure is a value, not an error.
#[derive(Debug, Clone)]
pub struct KeyValidation {
    /// Present whenever the secret resolved to a stored key, valid or not.
    pub key: Option<ApiKey>,
    pub outcome: std::result::Result<(), InvalidReason>,
}

impl KeyValidation {
    pub fn valid(key: ApiKey) -> Self {
        Self {
            key: Some(key),
            outcome: Ok(()),
        }
    }

    pub fn invalid(key: Option<ApiKey>, reason: InvalidReason) -> Self {
        Self {
            key,
            outcome: Err(reason),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn reason(&self) -> Option<InvalidReason> {
        self.outcome.err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_allow_list() {
        assert_eq!("read:keys".parse::<Permission>().unwrap(), Permission::ReadKeys);
        let err = "admin:*".parse::<Permission>().unwrap_err();
        assert_eq!(err.code(), "invalid_permission");
    }

    #[test]
    fn test_permission_set_rejects_empty_and_unknown() {
        assert!(PermissionSet::new([]).is_err());
        assert!(PermissionSet::parse(&["read:keys", "delete:everything"]).is_err());

        let set = PermissionSet::parse(&["write:keys", "read:keys", "read:keys"]).unwrap();
        assert_eq!(set.to_strings(), vec!["read:keys", "write:keys"]);
    }

    #[test]
    fn test_permission_set_deserialization_is_validated() {
        let set: PermissionSet = serde_json::from_str(r#"["read:accounts"]"#).unwrap();
        assert!(set.contains(Permission::ReadAccounts));
        assert!(!set.contains(Permission::WriteKeys));

        assert!(serde_json::from_str::<PermissionSet>(r#"["root"]"#).is_err());
        assert!(serde_json::from_str::<PermissionSet>("[]").is_err());

        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["read:accounts"]"#);
    }

    #[test]
    fn test_key_name_bounds() {
        assert!(validate_key_name("ci").is_err());
        assert!(validate_key_name("   ").is_err());
        assert_eq!(validate_key_name(" deploy bot ").unwrap(), "deploy bot");
    }

    #[test]
    fn test_raw_secret_debug_is_redacted() {
        let secret = RawSecret::new("deadbeef".repeat(8));
        assert_eq!(format!("{secret:?}"), "RawSecret(***)");
    }
}
