use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyStatus {
    Pending,
    Completed,
}

/// Dedup marker for one logical write, addressed by its request fingerprint.
///
/// `expired` is not stored; it is derived from `expires_at` at read time so a
/// record the backing store has not evicted yet still reads as expired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub id: Uuid,
    pub account_id: Option<Uuid>,
    pub fingerprint: String,
    pub status: IdempotencyStatus,
    pub response: Option<CachedResponse>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn pending(
        account_id: Option<Uuid>,
        fingerprint: String,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            fingerprint,
            status: IdempotencyStatus::Pending,
            response: None,
            created_at: now,
            expires_at: now + retention,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Response captured from the handler that executed the original request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

/// Ledger answer for a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyCheck {
    Absent,
    Pending(IdempotencyRecord),
    Completed(CachedResponse),
    Expired,
}

impl IdempotencyCheck {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyCheck::Absent => "absent",
            IdempotencyCheck::Pending(_) => "pending",
            IdempotencyCheck::Completed(_) => "completed",
            IdempotencyCheck::Expired => "expired",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_expiry_boundary_is_inclusive() {
        let now = Utc::now();
        let record = IdempotencyRecord::pending(None, "fp".into(), now, Duration::hours(24));
        assert!(!record.is_expired_at(now + Duration::hours(24) - Duration::microseconds(1)));
        assert!(record.is_expired_at(now + Duration::hours(24)));
    }
}
