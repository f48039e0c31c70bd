// Periodic retention sweeps over every store with a TTL

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::audit::AuditRecorder;
use crate::auth::ApiKeyRegistry;
use crate::errors::Result;
use crate::idempotency::IdempotencyLedger;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub api_keys: u64,
    pub idempotency_records: u64,
    pub audit_events: u64,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.api_keys + self.idempotency_records + self.audit_events
    }
}

pub struct RetentionSweeper {
    registry: ApiKeyRegistry,
    ledger: IdempotencyLedger,
    audit: AuditRecorder,
    every: Duration,
}

impl RetentionSweeper {
    pub fn new(
        registry: ApiKeyRegistry,
        ledger: IdempotencyLedger,
        audit: AuditRecorder,
        every: Duration,
    ) -> Self {
        Self {
            registry,
            ledger,
            audit,
            every,
        }
    }

    /// Runs each purge once. A failing store only skips its own purge.
    pub async fn sweep_once(&self) -> SweepReport {
        let report = SweepReport {
            api_keys: purged("api_keys", self.registry.purge_expired().await),
            idempotency_records: purged("idempotency", self.ledger.purge_expired().await),
            audit_events: purged("audit", self.audit.purge_expired().await),
        };

        if report.total() > 0 {
            info!(
                api_keys = report.api_keys,
                idempotency_records = report.idempotency_records,
                audit_events = report.audit_events,
                "Retention sweep removed expired records"
            );
        } else {
            debug!("Retention sweep found nothing to remove");
        }
        report
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so startup stays quiet.
            ticker.tick().await;

            info!(interval_seconds = self.every.as_secs(), "Retention sweeper started");
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }
}

fn purged(store: &'static str, result: Result<u64>) -> u64 {
    result.unwrap_or_else(|e| {
        warn!(store, error = %e, "Retention purge failed");
        0
    })
}
