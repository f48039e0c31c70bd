use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::domain::{CachedResponse, IdempotencyCheck, IdempotencyRecord, IdempotencyStatus};
use crate::errors::{AppError, Result};
use crate::observability::MetricsRecorder;
use crate::store::{with_deadline, IdempotencyStore, InsertOutcome};

/// What `begin` decided for a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Begin {
    /// New pending record; run the handler, then `complete` or `abandon`.
    Started(IdempotencyRecord),
    /// Already executed; send this instead of running the handler again.
    Replay(CachedResponse),
}

/// Dedup records for client-retried writes.
#[derive(Clone)]
pub struct IdempotencyLedger {
    store: Arc<dyn IdempotencyStore>,
    clock: Arc<dyn Clock>,
    retention: ChronoDuration,
    deadline: Duration,
}

impl IdempotencyLedger {
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        clock: Arc<dyn Clock>,
        retention: ChronoDuration,
        deadline: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            retention,
            deadline,
        }
    }

    /// Read-only view of a fingerprint. A record past its retention reads as
    /// `Expired` even if the store still holds it.
    pub async fn check(&self, fingerprint: &str) -> Result<IdempotencyCheck> {
        let record = with_deadline(self.deadline, "idempotency_get", self.store.get(fingerprint)).await?;
        let now = self.clock.now();

        Ok(match record {
            None => IdempotencyCheck::Absent,
            Some(record) if record.is_expired_at(now) => IdempotencyCheck::Expired,
            Some(record) => match (record.status, record.response.clone()) {
                (IdempotencyStatus::Completed, Some(response)) => IdempotencyCheck::Completed(response),
                _ => IdempotencyCheck::Pending(record),
            },
        })
    }

    /// Claims a fingerprint with an atomic insert-if-absent.
    ///
    /// A concurrent or earlier in-flight claim fails with `IdempotencyKeyPending`.
    pub async fn begin(&self, account_id: Option<Uuid>, fingerprint: String) -> Result<Begin> {
        let now = self.clock.now();
        let record = IdempotencyRecord::pending(account_id, fingerprint, now, self.retention);

        let outcome = with_deadline(
            self.deadline,
            "idempotency_insert",
            self.store.insert_if_absent(&record, now),
        )
        .await?;

        match outcome {
            InsertOutcome::Inserted => {
                MetricsRecorder::record_idempotency("started");
                debug!(record_id = %record.id, "Idempotency record created");
                Ok(Begin::Started(record))
            }
            InsertOutcome::Exists(existing) => match (existing.status, existing.response) {
                (IdempotencyStatus::Completed, Some(response)) => {
                    MetricsRecorder::record_idempotency("replayed");
                    debug!(record_id = %existing.id, "Replaying completed request");
                    Ok(Begin::Replay(response))
                }
                (IdempotencyStatus::Completed, None) => {
                    error!(record_id = %existing.id, "Completed idempotency record has no cached response");
                    Err(AppError::Internal(
                        "idempotency record completed without a response".to_string(),
                    ))
                }
                (IdempotencyStatus::Pending, _) => {
                    MetricsRecorder::record_idempotency("conflict");
                    warn!(record_id = %existing.id, "Request with this idempotency key is in flight");
                    Err(AppError::IdempotencyKeyPending)
                }
            },
        }
    }

    /// `pending -> completed`; the response is kept for the rest of the retention window.
    pub async fn complete(&self, record_id: Uuid, response: &CachedResponse) -> Result<()> {
        with_deadline(
            self.deadline,
            "idempotency_complete",
            self.store.complete(record_id, response),
        )
        .await?;
        MetricsRecorder::record_idempotency("completed");
        Ok(())
    }

    /// Releases a pending claim so the client may retry.
    pub async fn abandon(&self, record_id: Uuid) -> Result<()> {
        with_deadline(self.deadline, "idempotency_abandon", self.store.abandon(record_id)).await?;
        MetricsRecorder::record_idempotency("abandoned");
        Ok(())
    }

    pub async fn purge_expired(&self) -> Result<u64> {
        let now = self.clock.now();
        with_deadline(self.deadline, "idempotency_purge", self.store.purge_expired(now)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryIdempotencyStore;

    fn ledger() -> (IdempotencyLedger, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let ledger = IdempotencyLedger::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            clock.clone(),
            ChronoDuration::hours(24),
            Duration::from_secs(1),
        );
        (ledger, clock)
    }

    fn created() -> CachedResponse {
        CachedResponse {
            status: 201,
            content_type: Some("application/json".to_string()),
            body: r#"{"id":"k-1"}"#.to_string(),
        }
    }

    fn started(begin: Begin) -> IdempotencyRecord {
        match begin {
            Begin::Started(record) => record,
            other => panic!("expected a new record, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_completed_record_without_response_is_internal_error() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let clock = Arc::new(ManualClock::default());
        let ledger = IdempotencyLedger::new(
            store.clone(),
            clock.clone(),
            ChronoDuration::hours(24),
            Duration::from_secs(1),
        );

        let mut broken =
            IdempotencyRecord::pending(None, "fp-9".into(), clock.now(), ChronoDuration::hours(24));
        broken.status = IdempotencyStatus::Completed;
        store.insert_if_absent(&broken, clock.now()).await.unwrap();

        let err = ledger.begin(None, "fp-9".into()).await.unwrap_err();
        assert_eq!(err.code(), "internal_error");
    }

    #[tokio::test]
    async fn test_second_begin_while_pending_conflicts() {
        let (ledger, _) = ledger();
        let record = started(ledger.begin(None, "fp-1".into()).await.unwrap());

        let second = ledger.begin(None, "fp-1".into()).await;
        assert!(matches!(second, Err(AppError::IdempotencyKeyPending)));

        match ledger.check("fp-1").await.unwrap() {
            IdempotencyCheck::Pending(pending) => assert_eq!(pending.id, record.id),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_begins_admit_exactly_one() {
        let (ledger, _) = ledger();
        let attempts = (0..8).map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.begin(None, "tok-1".into()).await })
        });

        let results = futures::future::join_all(attempts).await;
        let started = results
            .iter()
            .filter(|r| matches!(r.as_ref().unwrap(), Ok(Begin::Started(_))))
            .count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r.as_ref().unwrap(), Err(AppError::IdempotencyKeyPending)))
            .count();
        assert_eq!(started, 1);
        assert_eq!(conflicts, 7);
    }

    #[tokio::test]
    async fn test_completed_request_replays_until_expiry() {
        let (ledger, clock) = ledger();
        let record = started(ledger.begin(None, "fp-2".into()).await.unwrap());
        ledger.complete(record.id, &created()).await.unwrap();

        clock.advance(ChronoDuration::hours(23));
        assert_eq!(
            ledger.begin(None, "fp-2".into()).await.unwrap(),
            Begin::Replay(created())
        );
        assert_eq!(ledger.check("fp-2").await.unwrap(), IdempotencyCheck::Completed(created()));

        clock.advance(ChronoDuration::hours(1));
        assert_eq!(ledger.check("fp-2").await.unwrap(), IdempotencyCheck::Expired);
        started(ledger.begin(None, "fp-2".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_double_completion_fails() {
        let (ledger, _) = ledger();
        let record = started(ledger.begin(None, "fp-3".into()).await.unwrap());
        ledger.complete(record.id, &created()).await.unwrap();

        assert!(matches!(
            ledger.complete(record.id, &created()).await,
            Err(AppError::IdempotencyNotPending)
        ));
        assert!(matches!(
            ledger.complete(Uuid::new_v4(), &created()).await,
            Err(AppError::IdempotencyRecordNotFound)
        ));
    }

    #[tokio::test]
    async fn test_abandon_releases_the_fingerprint() {
        let (ledger, _) = ledger();
        let record = started(ledger.begin(None, "fp-4".into()).await.unwrap());
        ledger.abandon(record.id).await.unwrap();

        assert_eq!(ledger.check("fp-4").await.unwrap(), IdempotencyCheck::Absent);
        started(ledger.begin(None, "fp-4".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_drops_expired_records() {
        let (ledger, clock) = ledger();
        started(ledger.begin(None, "fp-5".into()).await.unwrap());
        assert_eq!(ledger.purge_expired().await.unwrap(), 0);

        clock.advance(ChronoDuration::hours(25));
        assert_eq!(ledger.purge_expired().await.unwrap(), 1);
        assert_eq!(ledger.check("fp-5").await.unwrap(), IdempotencyCheck::Absent);
    }
}
