use sha2::{Digest, Sha256};

use crate::auth::key_material::constant_time_eq;
use crate::domain::AuditEvent;

/// SHA-256 hash chain over audit events.
///
/// Each event stores the hash of its predecessor, so editing or removing any
/// event breaks every link after it.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashChain;

impl HashChain {
    pub fn new() -> Self {
        Self
    }

    /// Hex-encoded SHA-256 over the canonical form of `event`, including `previous_hash`.
    pub fn compute_hash(&self, event: &AuditEvent) -> String {
        hex::encode(Sha256::digest(canonicalize(event).as_bytes()))
    }

    /// Links `event` after `previous` and stamps its own hash.
    pub fn seal(&self, event: &mut AuditEvent, previous: Option<String>) {
        event.previous_hash = previous;
        event.event_hash = self.compute_hash(event);
    }

    pub fn verify_hash(&self, event: &AuditEvent) -> bool {
        constant_time_eq(&self.compute_hash(event), &event.event_hash)
    }

    /// Index of the first event whose hash or back-link does not check out.
    ///
    /// `events` must be a contiguous, chronologically ordered run; the first
    /// event's back-link is taken on trust since its predecessor is not present.
    pub fn find_chain_break(&self, events: &[AuditEvent]) -> Option<usize> {
        let mut previous: Option<&str> = None;
        for (idx, event) in events.iter().enumerate() {
            if !self.verify_hash(event) {
                tracing::warn!(event_id = %event.id, index = idx, "Audit event hash mismatch");
                return Some(idx);
            }
            if let Some(expected) = previous {
                let linked = event
                    .previous_hash
                    .as_deref()
                    .is_some_and(|actual| constant_time_eq(actual, expected));
                if !linked {
                    tracing::warn!(event_id = %event.id, index = idx, "Audit hash chain broken");
                    return Some(idx);
                }
            }
            previous = Some(&event.event_hash);
        }
        None
    }

    pub fn verify_chain(&self, events: &[AuditEvent]) -> bool {
        self.find_chain_break(events).is_none()
    }
}

fn canonicalize(event: &AuditEvent) -> String {
    fn opt<T: ToString>(value: Option<T>) -> String {
        value.map_or_else(|| "null".to_string(), |v| v.to_string())
    }

    let detail = event
        .detail
        .iter()
        .map(|(k, v)| format!("{}:{}", k.escape_default(), v.escape_default()))
        .collect::<Vec<_>>()
        .join(",");

    [
        format!("id={}", event.id),
        format!("partition_key={}", event.partition_key),
        format!("sort_key={}", event.sort_key),
        format!("category={}", event.category.as_str()),
        format!("occurred_at={}", event.occurred_at.timestamp_micros()),
        format!("account_id={}", opt(event.account_id)),
        format!("api_key_id={}", opt(event.api_key_id)),
        format!("key_name={}", opt(event.key_name.as_deref().map(str::escape_default))),
        format!("source_ip={}", event.source_ip.escape_default()),
        format!("user_agent={}", event.user_agent.escape_default()),
        format!("success={}", event.success),
        format!("detail={{{}}}", detail),
        format!("expires_at={}", event.expires_at.timestamp()),
        format!("previous_hash={}", opt(event.previous_hash.as_deref())),
    ]
    .join("|")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AuditCategory;
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn event(n: i64) -> AuditEvent {
        let occurred_at = Utc::now() + Duration::seconds(n);
        AuditEvent {
            id: Uuid::new_v4(),
            partition_key: AuditCategory::Authentication.partition_key(occurred_at.date_naive()),
            sort_key: crate::domain::audit::sort_key(occurred_at, occurred_at.timestamp_micros(), "test"),
            category: AuditCategory::Authentication,
            occurred_at,
            account_id: Some(Uuid::new_v4()),
            api_key_id: None,
            key_name: None,
            source_ip: "203.0.113.9".to_string(),
            user_agent: "curl/8.4".to_string(),
            success: false,
            detail: BTreeMap::from([("reason".to_string(), "unknown_api_key".to_string())]),
            expires_at: occurred_at + Duration::days(90),
            previous_hash: None,
            event_hash: String::new(),
        }
    }

    fn sealed_chain(len: i64) -> Vec<AuditEvent> {
        let chain = HashChain::new();
        let mut previous = None;
        (0..len)
            .map(|n| {
                let mut e = event(n);
                chain.seal(&mut e, previous.take());
                previous = Some(e.event_hash.clone());
                e
            })
            .collect()
    }

    #[test]
    fn test_hash_is_deterministic_hex() {
        let chain = HashChain::new();
        let e = event(0);
        let hash = chain.compute_hash(&e);
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, chain.compute_hash(&e));
    }

    #[test]
    fn test_hash_covers_previous_link() {
        let chain = HashChain::new();
        let mut a = event(0);
        let mut b = a.clone();
        chain.seal(&mut a, None);
        chain.seal(&mut b, Some("00".repeat(32)));
        assert_ne!(a.event_hash, b.event_hash);
    }

    #[test]
    fn test_valid_chain_verifies() {
        assert!(HashChain::new().verify_chain(&sealed_chain(5)));
        assert!(HashChain::new().verify_chain(&[]));
    }

    #[test]
    fn test_tampered_event_is_located() {
        let mut events = sealed_chain(5);
        events[2].success = true;
        assert_eq!(HashChain::new().find_chain_break(&events), Some(2));
    }

    #[test]
    fn test_removed_event_is_located() {
        let mut events = sealed_chain(5);
        events.remove(3);
        assert_eq!(HashChain::new().find_chain_break(&events), Some(3));
    }

    #[test]
    fn test_partial_export_verifies() {
        let events = sealed_chain(6);
        assert!(HashChain::new().verify_chain(&events[2..]));
    }
}
