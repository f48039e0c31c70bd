use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::{AppError, Result};

pub const AUDIT_RETENTION_DAYS: i64 = 90;

/// Audit event categories; each category gets its own daily partition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Authentication,
    KeyIssued,
    KeyRevoked,
    AccountCreated,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCategory::Authentication => "authentication",
            AuditCategory::KeyIssued => "key_issued",
            AuditCategory::KeyRevoked => "key_revoked",
            AuditCategory::AccountCreated => "account_created",
        }
    }

    /// Partition key: category plus calendar day (UTC).
    pub fn partition_key(&self, day: NaiveDate) -> String {
        format!("AUDIT#{}#{}", self.as_str(), day.format("%Y-%m-%d"))
    }
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditCategory {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "authentication" => Ok(AuditCategory::Authentication),
            "key_issued" => Ok(AuditCategory::KeyIssued),
            "key_revoked" => Ok(AuditCategory::KeyRevoked),
            "account_created" => Ok(AuditCategory::AccountCreated),
            other => Err(AppError::InvalidQuery(format!("unknown audit category `{other}`"))),
        }
    }
}

/// Sort key within a partition: date, a microsecond stamp that strictly
/// increases per writer, then the writer id so concurrent instances never
/// produce the same key.
pub fn sort_key(occurred_at: DateTime<Utc>, sequence_micros: i64, writer_id: &str) -> String {
    format!(
        "{}#{:020}#{}",
        occurred_at.format("%Y-%m-%d"),
        sequence_micros,
        writer_id
    )
}

/// Where a request came from, as recorded on audit events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub source_ip: String,
    pub user_agent: String,
}

impl RequestContext {
    pub fn new(source_ip: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            source_ip: source_ip.into(),
            user_agent: user_agent.into(),
        }
    }
}

/// An event to be appended, before the writer assigns keys and chain hashes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub category: AuditCategory,
    pub occurred_at: DateTime<Utc>,
    pub account_id: Option<Uuid>,
    pub api_key_id: Option<Uuid>,
    pub key_name: Option<String>,
    pub source_ip: String,
    pub user_agent: String,
    pub success: bool,
    pub detail: BTreeMap<String, String>,
}

impl AuditEntry {
    pub fn new(category: AuditCategory, context: &RequestContext, occurred_at: DateTime<Utc>) -> Self {
        Self {
            category,
            occurred_at,
            account_id: None,
            api_key_id: None,
            key_name: None,
            source_ip: context.source_ip.clone(),
            user_agent: context.user_agent.clone(),
            success: true,
            detail: BTreeMap::new(),
        }
    }

    pub fn with_account(mut self, account_id: Uuid) -> Self {
        self.account_id = Some(account_id);
        self
    }

    pub fn with_key(mut self, key_id: Uuid, key_name: impl Into<String>) -> Self {
        self.api_key_id = Some(key_id);
        self.key_name = Some(key_name.into());
        self
    }

    pub fn with_success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.detail.insert(key.into(), value.into());
        self
    }
}

/// Immutable, persisted audit event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub partition_key: String,
    pub sort_key: String,
    pub category: AuditCategory,
    pub occurred_at: DateTime<Utc>,
    pub account_id: Option<Uuid>,
    pub api_key_id: Option<Uuid>,
    pub key_name: Option<String>,
    pub source_ip: String,
    pub user_agent: String,
    pub success: bool,
    pub detail: BTreeMap<String, String>,
    pub expires_at: DateTime<Utc>,
    pub previous_hash: Option<String>,
    pub event_hash: String,
}

/// Audit query. At least one of `category` or `account_id` is required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditQuery {
    pub category: Option<AuditCategory>,
    pub account_id: Option<Uuid>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub limit: usize,
}

pub const AUDIT_QUERY_MAX_LIMIT: usize = 1000;
pub const AUDIT_QUERY_MAX_RANGE_DAYS: i64 = AUDIT_RETENTION_DAYS;

impl AuditQuery {
    pub fn validate(&self) -> Result<()> {
        if self.category.is_none() && self.account_id.is_none() {
            return Err(AppError::InvalidQuery(
                "a category or an account id is required".to_string(),
            ));
        }
        if self.from >= self.to {
            return Err(AppError::InvalidQuery("`from` must be before `to`".to_string()));
        }
        if self.to - self.from > Duration::days(AUDIT_QUERY_MAX_RANGE_DAYS) {
            return Err(AppError::InvalidQuery(format!(
                "time range must not exceed {AUDIT_QUERY_MAX_RANGE_DAYS} days"
            )));
        }
        if self.limit == 0 || self.limit > AUDIT_QUERY_MAX_LIMIT {
            return Err(AppError::InvalidQuery(format!(
                "limit must be between 1 and {AUDIT_QUERY_MAX_LIMIT}"
            )));
        }
        Ok(())
    }

    /// Partitions a category query has to read, one per calendar day in range.
    pub fn partitions(&self) -> Vec<String> {
        let Some(category) = self.category else {
            return Vec::new();
        };
        self.from
            .date_naive()
            .iter_days()
            .take_while(|day| *day <= self.to.date_naive())
            .map(|day| category.partition_key(day))
            .collect()
    }

    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.category.map_or(true, |c| c == event.category)
            && self.account_id.map_or(true, |a| event.account_id == Some(a))
            && event.occurred_at >= self.from
            && event.occurred_at < self.to
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_partition_key_layout() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(
            AuditCategory::Authentication.partition_key(day),
            "AUDIT#authentication#2024-03-09"
        );
    }

    #[test]
    fn test_sort_keys_order_chronologically() {
        let a = sort_key(at(2024, 3, 9, 23), at(2024, 3, 9, 23).timestamp_micros(), "ffffffff");
        let b = sort_key(at(2024, 3, 10, 1), at(2024, 3, 10, 1).timestamp_micros(), "00000000");
        assert!(a < b);
    }

    #[test]
    fn test_sort_keys_from_different_writers_differ() {
        let t = at(2024, 3, 9, 23);
        let a = sort_key(t, t.timestamp_micros(), "1a2b3c4d");
        let b = sort_key(t, t.timestamp_micros(), "5e6f7a8b");
        assert_ne!(a, b);
        assert!(a.starts_with("2024-03-09#"));
    }

    #[test]
    fn test_query_requires_category_or_account() {
        let query = AuditQuery {
            category: None,
            account_id: None,
            from: at(2024, 3, 1, 0),
            to: at(2024, 3, 2, 0),
            limit: 10,
        };
        assert_eq!(query.validate().unwrap_err().code(), "invalid_query");

        let query = AuditQuery {
            account_id: Some(Uuid::new_v4()),
            ..query
        };
        assert!(query.validate().is_ok());
    }

    #[test]
    fn test_category_query_spans_daily_partitions() {
        let query = AuditQuery {
            category: Some(AuditCategory::KeyIssued),
            account_id: None,
            from: at(2024, 2, 28, 12),
            to: at(2024, 3, 1, 6),
            limit: 10,
        };
        assert_eq!(
            query.partitions(),
            vec![
                "AUDIT#key_issued#2024-02-28",
                "AUDIT#key_issued#2024-02-29",
                "AUDIT#key_issued#2024-03-01",
            ]
        );
    }
}
