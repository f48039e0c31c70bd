use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::tamper_proof::HashChain;
use crate::clock::Clock;
use crate::config::AuditConfig;
use crate::domain::audit::sort_key;
use crate::domain::{AuditCategory, AuditEntry, AuditEvent, AuditQuery, RequestContext};
use crate::errors::{BestEffort, Result};
use crate::observability::MetricsRecorder;
use crate::store::{with_deadline, AuditStore};

enum AuditCommand {
    Record(AuditEntry),
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget audit writer.
///
/// `record` only enqueues; a background task batches entries, assigns partition
/// and sort keys, chains hashes and writes to the store. Write failures are
/// logged and counted, never returned to the caller.
#[derive(Clone)]
pub struct AuditRecorder {
    sender: Option<mpsc::Sender<AuditCommand>>,
    store: Arc<dyn AuditStore>,
    clock: Arc<dyn Clock>,
    deadline: Duration,
}

impl AuditRecorder {
    /// Starts the background writer. Must be called inside a Tokio runtime.
    pub fn spawn(
        store: Arc<dyn AuditStore>,
        clock: Arc<dyn Clock>,
        config: &AuditConfig,
        deadline: Duration,
    ) -> Self {
        let sender = if config.enabled {
            let (sender, receiver) = mpsc::channel(config.channel_buffer_size);
            let writer = BatchWriter {
                store: store.clone(),
                clock: clock.clone(),
                chain: HashChain::new(),
                retention: ChronoDuration::days(config.retention_days),
                deadline,
                head_hash: None,
                last_micros: i64::MIN,
                writer_id: new_writer_id(),
            };
            tokio::spawn(batch_processor(receiver, writer, config.clone()));
            Some(sender)
        } else {
            info!("Audit recording disabled");
            None
        };

        Self {
            sender,
            store,
            clock,
            deadline,
        }
    }

    /// Starts an entry stamped with the current time.
    pub fn entry(&self, category: AuditCategory, context: &RequestContext) -> AuditEntry {
        AuditEntry::new(category, context, self.clock.now())
    }

    /// Queues one event. Never blocks and never fails the caller.
    pub fn record(&self, entry: AuditEntry) -> BestEffort {
        let Some(sender) = &self.sender else {
            return BestEffort::Dropped;
        };

        match sender.try_send(AuditCommand::Record(entry)) {
            Ok(()) => BestEffort::Accepted,
            Err(mpsc::error::TrySendError::Full(AuditCommand::Record(entry))) => {
                error!(
                    category = entry.category.as_str(),
                    "Audit queue full, dropping event"
                );
                MetricsRecorder::record_audit_dropped();
                BestEffort::Dropped
            }
            Err(_) => {
                error!("Audit writer stopped, dropping event");
                MetricsRecorder::record_audit_dropped();
                BestEffort::Dropped
            }
        }
    }

    /// Waits until everything queued so far has been handed to the store.
    pub async fn flush(&self) {
        let Some(sender) = &self.sender else {
            return;
        };
        let (ack, done) = oneshot::channel();
        if sender.send(AuditCommand::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Category and/or account scoped time-range query, oldest first.
    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        query.validate()?;
        with_deadline(self.deadline, "audit_query", self.store.query(query)).await
    }

    /// Deletes events past their retention TTL.
    pub async fn purge_expired(&self) -> Result<u64> {
        let now = self.clock.now();
        with_deadline(self.deadline, "audit_purge", self.store.purge_expired(now)).await
    }
}

struct BatchWriter {
    store: Arc<dyn AuditStore>,
    clock: Arc<dyn Clock>,
    chain: HashChain,
    retention: ChronoDuration,
    deadline: Duration,
    head_hash: Option<String>,
    last_micros: i64,
    writer_id: String,
}

/// Short random tag distinguishing this process's sort keys from other instances'.
fn new_writer_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

impl BatchWriter {
    async fn resume_chain(&mut self) {
        match with_deadline(self.deadline, "audit_latest_hash", self.store.latest_hash()).await {
            Ok(head) => self.head_hash = head,
            Err(e) => warn!("Could not load audit chain head, starting a new chain: {}", e),
        }
        self.last_micros = self.clock.now().timestamp_micros();
    }

    fn seal(&mut self, entry: AuditEntry) -> AuditEvent {
        // Sort keys must strictly increase even when entries share a timestamp.
        let micros = entry.occurred_at.timestamp_micros().max(self.last_micros + 1);
        self.last_micros = micros;

        let mut event = AuditEvent {
            id: Uuid::new_v4(),
            partition_key: entry.category.partition_key(entry.occurred_at.date_naive()),
            sort_key: sort_key(entry.occurred_at, micros, &self.writer_id),
            category: entry.category,
            occurred_at: entry.occurred_at,
            account_id: entry.account_id,
            api_key_id: entry.api_key_id,
            key_name: entry.key_name,
            source_ip: entry.source_ip,
            user_agent: entry.user_agent,
            success: entry.success,
            detail: entry.detail,
            expires_at: entry.occurred_at + self.retention,
            previous_hash: None,
            event_hash: String::new(),
        };
        self.chain.seal(&mut event, self.head_hash.clone());
        self.head_hash = Some(event.event_hash.clone());
        event
    }

    /// Writes the batch. On failure the chain head rolls back and the events are dropped.
    async fn flush(&mut self, batch: &mut Vec<AuditEntry>) {
        if batch.is_empty() {
            return;
        }

        let count = batch.len();
        let start = std::time::Instant::now();
        let head_before = self.head_hash.clone();
        let micros_before = self.last_micros;

        let events: Vec<AuditEvent> = batch.drain(..).map(|entry| self.seal(entry)).collect();

        match with_deadline(self.deadline, "audit_append", self.store.append(&events)).await {
            Ok(()) => {
                let duration = start.elapsed();
                debug!("Flushed {} audit events to storage in {:?}", count, duration);
                MetricsRecorder::record_audit_written(count, duration.as_secs_f64());
            }
            Err(e) => {
                error!(
                    error = %e,
                    dropped = count,
                    "Failed to persist audit batch"
                );
                self.head_hash = head_before;
                self.last_micros = micros_before;
                MetricsRecorder::record_audit_write_failure(count, start.elapsed().as_secs_f64());
            }
        }
    }
}

/// Background batch processor that accumulates events and writes them in batches
async fn batch_processor(
    mut receiver: mpsc::Receiver<AuditCommand>,
    mut writer: BatchWriter,
    config: AuditConfig,
) {
    writer.resume_chain().await;

    let mut batch: Vec<AuditEntry> = Vec::with_capacity(config.batch_size);
    let mut flush_interval = interval(Duration::from_millis(config.batch_timeout_ms));

    info!(
        writer_id = %writer.writer_id,
        batch_size = config.batch_size,
        timeout_ms = config.batch_timeout_ms,
        "Audit batch processor started"
    );

    loop {
        tokio::select! {
            command = receiver.recv() => match command {
                Some(AuditCommand::Record(entry)) => {
                    batch.push(entry);
                    if batch.len() >= config.batch_size {
                        writer.flush(&mut batch).await;
                    }
                }
                Some(AuditCommand::Flush(ack)) => {
                    writer.flush(&mut batch).await;
                    let _ = ack.send(());
                }
                None => {
                    warn!("Audit channel closed, flushing remaining events");
                    writer.flush(&mut batch).await;
                    break;
                }
            },

            _ = flush_interval.tick() => {
                writer.flush(&mut batch).await;
            }
        }
    }

    info!("Audit batch processor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::errors::AppError;
    use crate::store::InMemoryAuditStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn config(batch_size: usize, batch_timeout_ms: u64) -> AuditConfig {
        AuditConfig {
            enabled: true,
            batch_size,
            batch_timeout_ms,
            channel_buffer_size: 100,
            retention_days: 90,
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new("198.51.100.7", "integration-test")
    }

    #[tokio::test]
    async fn test_batches_until_size_reached() {
        let store = Arc::new(InMemoryAuditStore::new());
        let clock = Arc::new(ManualClock::default());
        let recorder =
            AuditRecorder::spawn(store.clone(), clock, &config(5, 60_000), Duration::from_secs(1));

        for _ in 0..3 {
            let entry = recorder.entry(AuditCategory::Authentication, &ctx());
            assert!(recorder.record(entry).is_accepted());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.all_events().await.len(), 0, "Events should not be flushed yet");

        for _ in 0..2 {
            let _ = recorder.record(recorder.entry(AuditCategory::Authentication, &ctx()));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.all_events().await.len(), 5, "All 5 events should be flushed");
    }

    #[tokio::test]
    async fn test_timeout_flush() {
        let store = Arc::new(InMemoryAuditStore::new());
        let clock = Arc::new(ManualClock::default());
        let recorder =
            AuditRecorder::spawn(store.clone(), clock, &config(100, 50), Duration::from_secs(1));

        let _ = recorder.record(recorder.entry(AuditCategory::KeyIssued, &ctx()));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.all_events().await.len(), 1, "Events should be flushed after timeout");
    }

    #[tokio::test]
    async fn test_events_are_keyed_and_chained() {
        let store = Arc::new(InMemoryAuditStore::new());
        let clock = Arc::new(ManualClock::default());
        let recorder = AuditRecorder::spawn(
            store.clone(),
            clock.clone(),
            &config(100, 60_000),
            Duration::from_secs(1),
        );

        let account = Uuid::new_v4();
        // Same instant on purpose: sort keys must still be distinct and ordered.
        for _ in 0..3 {
            let entry = recorder
                .entry(AuditCategory::KeyIssued, &ctx())
                .with_account(account);
            let _ = recorder.record(entry);
        }
        recorder.flush().await;

        let events = store.all_events().await;
        assert_eq!(events.len(), 3);
        assert!(events.windows(2).all(|w| w[0].sort_key < w[1].sort_key));
        assert_eq!(
            events[0].partition_key,
            format!("AUDIT#key_issued#{}", clock.now().format("%Y-%m-%d"))
        );
        assert_eq!(events[0].expires_at, events[0].occurred_at + ChronoDuration::days(90));
        assert!(HashChain::new().verify_chain(&events));
    }

    #[tokio::test]
    async fn test_query_is_scoped_and_validated() {
        let store = Arc::new(InMemoryAuditStore::new());
        let clock = Arc::new(ManualClock::default());
        let recorder = AuditRecorder::spawn(
            store.clone(),
            clock.clone(),
            &config(100, 60_000),
            Duration::from_secs(1),
        );

        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let _ = recorder.record(recorder.entry(AuditCategory::KeyIssued, &ctx()).with_account(a));
        let _ = recorder.record(
            recorder
                .entry(AuditCategory::Authentication, &ctx())
                .with_account(a)
                .with_success(false),
        );
        let _ = recorder.record(recorder.entry(AuditCategory::KeyIssued, &ctx()).with_account(b));
        recorder.flush().await;

        let now = clock.now();
        let window = |category, account_id| AuditQuery {
            category,
            account_id,
            from: now - ChronoDuration::hours(1),
            to: now + ChronoDuration::hours(1),
            limit: 100,
        };

        assert_eq!(recorder.query(&window(None, Some(a))).await.unwrap().len(), 2);
        assert_eq!(
            recorder
                .query(&window(Some(AuditCategory::KeyIssued), None))
                .await
                .unwrap()
                .len(),
            2
        );
        let failed_logins = recorder
            .query(&window(Some(AuditCategory::Authentication), Some(a)))
            .await
            .unwrap();
        assert_eq!(failed_logins.len(), 1);
        assert!(!failed_logins[0].success);

        assert!(matches!(
            recorder.query(&window(None, None)).await,
            Err(AppError::InvalidQuery(_))
        ));
    }

    #[tokio::test]
    async fn test_purge_respects_retention() {
        let store = Arc::new(InMemoryAuditStore::new());
        let clock = Arc::new(ManualClock::default());
        let recorder = AuditRecorder::spawn(
            store.clone(),
            clock.clone(),
            &config(100, 60_000),
            Duration::from_secs(1),
        );

        let _ = recorder.record(recorder.entry(AuditCategory::AccountCreated, &ctx()));
        recorder.flush().await;

        clock.advance(ChronoDuration::days(89));
        assert_eq!(recorder.purge_expired().await.unwrap(), 0);
        clock.advance(ChronoDuration::days(1));
        assert_eq!(recorder.purge_expired().await.unwrap(), 1);
        assert!(store.all_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_two_writers_in_same_instant_do_not_collide() {
        let store = Arc::new(InMemoryAuditStore::new());
        let clock = Arc::new(ManualClock::default());
        let first = AuditRecorder::spawn(
            store.clone(),
            clock.clone(),
            &config(100, 60_000),
            Duration::from_secs(1),
        );
        let second = AuditRecorder::spawn(
            store.clone(),
            clock.clone(),
            &config(100, 60_000),
            Duration::from_secs(1),
        );

        let _ = first.record(first.entry(AuditCategory::KeyIssued, &ctx()));
        let _ = second.record(second.entry(AuditCategory::KeyIssued, &ctx()));
        first.flush().await;
        second.flush().await;

        let events = store.all_events().await;
        assert_eq!(events.len(), 2);
        assert_ne!(events[0].sort_key, events[1].sort_key);
    }

    struct FlakyStore {
        inner: InMemoryAuditStore,
        failing: AtomicBool,
    }

    #[async_trait]
    impl AuditStore for FlakyStore {
        async fn append(&self, events: &[AuditEvent]) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(AppError::StoreUnavailable("audit table offline".into()));
            }
            self.inner.append(events).await
        }

        async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
            self.inner.query(query).await
        }

        async fn latest_hash(&self) -> Result<Option<String>> {
            self.inner.latest_hash().await
        }

        async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
            self.inner.purge_expired(now).await
        }
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_break_chain() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryAuditStore::new(),
            failing: AtomicBool::new(false),
        });
        let clock = Arc::new(ManualClock::default());
        let recorder = AuditRecorder::spawn(
            store.clone(),
            clock,
            &config(100, 60_000),
            Duration::from_secs(1),
        );

        let _ = recorder.record(recorder.entry(AuditCategory::KeyIssued, &ctx()));
        recorder.flush().await;

        store.failing.store(true, Ordering::SeqCst);
        let accepted = recorder.record(recorder.entry(AuditCategory::KeyRevoked, &ctx()));
        assert!(accepted.is_accepted(), "enqueueing succeeds even while the store is down");
        recorder.flush().await;

        store.failing.store(false, Ordering::SeqCst);
        let _ = recorder.record(recorder.entry(AuditCategory::KeyIssued, &ctx()));
        recorder.flush().await;

        let events = store.inner.all_events().await;
        assert_eq!(events.len(), 2);
        assert!(HashChain::new().verify_chain(&events));
    }
}
