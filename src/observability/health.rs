use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;

use crate::errors::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub checks: Vec<ComponentStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub name: String,
    pub status: String,
    pub message: Option<String>,
}

/// A backing dependency whose reachability gates readiness.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self) -> Result<()>;
}

pub struct PostgresProbe(pub PgPool);

#[async_trait]
impl HealthProbe for PostgresProbe {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn check(&self) -> Result<()> {
        crate::db::health_check(&self.0).await
    }
}

pub struct RedisProbe(pub ConnectionManager);

#[async_trait]
impl HealthProbe for RedisProbe {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn check(&self) -> Result<()> {
        crate::redis::ping(&self.0).await
    }
}

#[derive(Clone, Default)]
pub struct HealthChecker {
    probes: Vec<Arc<dyn HealthProbe>>,
}

impl HealthChecker {
    pub fn new(probes: Vec<Arc<dyn HealthProbe>>) -> Self {
        Self { probes }
    }

    /// Liveness check - is the service running?
    pub async fn liveness(&self) -> HealthStatus {
        HealthStatus {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            checks: Vec::new(),
        }
    }

    /// Readiness check - can every backing store be reached?
    pub async fn readiness(&self) -> HealthStatus {
        let checks = futures::future::join_all(self.probes.iter().map(|probe| async move {
            match probe.check().await {
                Ok(()) => ComponentStatus {
                    name: probe.name().to_string(),
                    status: "ok".to_string(),
                    message: None,
                },
                Err(e) => {
                    tracing::warn!(component = probe.name(), error = %e, "Health probe failed");
                    ComponentStatus {
                        name: probe.name().to_string(),
                        status: "error".to_string(),
                        message: Some(format!("{} check failed", probe.name())),
                    }
                }
            }
        }))
        .await;

        let overall = if checks.iter().all(|c| c.status == "ok") {
            "ok"
        } else {
            "degraded"
        };

        HealthStatus {
            status: overall.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            checks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;

    struct Fixed(bool);

    #[async_trait]
    impl HealthProbe for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn check(&self) -> Result<()> {
            if self.0 {
                Ok(())
            } else {
                Err(AppError::StoreUnavailable("down".into()))
            }
        }
    }

    #[tokio::test]
    async fn test_readiness_degrades_on_failed_probe() {
        let healthy = HealthChecker::new(vec![Arc::new(Fixed(true))]);
        assert_eq!(healthy.readiness().await.status, "ok");

        let degraded = HealthChecker::new(vec![Arc::new(Fixed(true)), Arc::new(Fixed(false))]);
        let status = degraded.readiness().await;
        assert_eq!(status.status, "degraded");
        assert_eq!(status.checks[1].status, "error");
    }
}
