use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::{RateLimitConfig, RateLimitPolicy};
use crate::errors::Result;
use crate::observability::MetricsRecorder;
use crate::store::{with_deadline, RateLimitStore};

/// Independent counter families, each with its own policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Ip,
    Account,
    Endpoint,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Ip => "ip",
            Dimension::Account => "account",
            Dimension::Endpoint => "endpoint",
        }
    }

    pub fn key(&self, identifier: &str) -> String {
        format!("{}:{}", self.as_str(), identifier)
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rate limit check result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub window: ChronoDuration,
}

impl RateLimitDecision {
    /// Retry hint sent on denial: the full window length.
    pub fn retry_after_seconds(&self) -> i64 {
        self.window.num_seconds()
    }
}

/// Fixed-window counters over the rate limit store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
    deadline: Duration,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
        config: RateLimitConfig,
        deadline: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            deadline,
        }
    }

    /// Counts one request against `key`.
    ///
    /// The first hit opens a window of `window`; hits are allowed while the
    /// count stays within `ceiling`; the first hit after the window closes
    /// starts over at 1.
    pub async fn check_and_increment(
        &self,
        key: &str,
        ceiling: u64,
        window: ChronoDuration,
    ) -> Result<RateLimitDecision> {
        let now = self.clock.now();
        let counter = with_deadline(
            self.deadline,
            "rate_limit_increment",
            self.store.increment(key, window, now),
        )
        .await?;

        tracing::debug!(
            key = %key,
            count = counter.count,
            ceiling,
            "Rate limit counter incremented"
        );

        Ok(RateLimitDecision {
            allowed: counter.count <= ceiling,
            limit: ceiling,
            remaining: ceiling.saturating_sub(counter.count),
            reset_at: counter.reset_at,
            window,
        })
    }

    /// Applies the configured policy for `dimension`.
    ///
    /// `None` means no limit applies: the policy is disabled or the store
    /// failed, in which case the request is let through.
    pub async fn check(&self, dimension: Dimension, identifier: &str) -> Option<RateLimitDecision> {
        let policy = self.policy(dimension);
        if !policy.enabled {
            return None;
        }

        let key = dimension.key(identifier);
        match self
            .check_and_increment(&key, policy.requests, policy.window())
            .await
        {
            Ok(decision) => {
                if !decision.allowed {
                    MetricsRecorder::record_rate_limit_exceeded(dimension.as_str());
                    tracing::warn!(
                        dimension = dimension.as_str(),
                        identifier = %identifier,
                        limit = decision.limit,
                        "Rate limit exceeded"
                    );
                }
                Some(decision)
            }
            Err(e) => {
                tracing::warn!(
                    dimension = dimension.as_str(),
                    error = %e,
                    "Rate limit store unavailable, allowing request"
                );
                None
            }
        }
    }

    /// Drops a counter. Administrative override only.
    pub async fn reset(&self, key: &str) -> Result<()> {
        with_deadline(self.deadline, "rate_limit_reset", self.store.reset(key)).await
    }

    pub fn policy(&self, dimension: Dimension) -> RateLimitPolicy {
        match dimension {
            Dimension::Ip => self.config.ip,
            Dimension::Account => self.config.account,
            Dimension::Endpoint => self.config.endpoint,
        }
    }
}
