//! Database maintenance operations.
//!
//! Periodic sweep that keeps the store small and self-healing:
//! - purge pairing codes past expiry plus a retention window
//! - archive (delete) terminal delivery tasks past their retention
//! - return claims whose lease ran out to `PENDING`
//! - drop rate-limit buckets that have refilled

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::database::repositories::{
    DeliveryTaskRepository, PairingCodeRepository, SqlxDeliveryTaskRepository,
    SqlxPairingCodeRepository,
};
use crate::database::time::{duration_to_ms, now_ms};
use crate::database::DbPool;
use crate::delivery::RateLimiter;
use crate::Result;

/// Configuration for the maintenance scheduler.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Interval between sweeps (default: 10 minutes).
    pub interval: Duration,
    /// How long expired pairing codes are kept (default: 24 hours).
    pub code_retention: Duration,
    /// How long terminal delivery tasks are kept (default: 7 days).
    pub task_retention: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10 * 60),
            code_retention: Duration::from_secs(24 * 60 * 60),
            task_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// What a single sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub codes_purged: u64,
    pub tasks_purged: u64,
    pub leases_reset: u64,
    pub buckets_purged: u64,
}

/// Database maintenance scheduler.
pub struct MaintenanceScheduler {
    codes: Arc<dyn PairingCodeRepository>,
    tasks: Arc<dyn DeliveryTaskRepository>,
    rate_limiter: Option<Arc<RateLimiter>>,
    config: MaintenanceConfig,
}

impl MaintenanceScheduler {
    pub fn new(pool: DbPool, config: MaintenanceConfig) -> Self {
        Self::with_repositories(
            Arc::new(SqlxPairingCodeRepository::new(pool.clone())),
            Arc::new(SqlxDeliveryTaskRepository::new(pool)),
            config,
        )
    }

    pub fn with_repositories(
        codes: Arc<dyn PairingCodeRepository>,
        tasks: Arc<dyn DeliveryTaskRepository>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            codes,
            tasks,
            rate_limiter: None,
            config,
        }
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    /// Start the sweep loop. It stops when `token` is cancelled.
    pub fn start(self: Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Maintenance scheduler shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = self.run_maintenance().await {
                            error!(error = %e, "Maintenance error");
                        }
                    }
                }
            }
        })
    }

    /// Run all maintenance tasks once.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        let now = now_ms();

        let report = MaintenanceReport {
            codes_purged: self
                .codes
                .purge_expired(now - duration_to_ms(self.config.code_retention))
                .await?,
            tasks_purged: self
                .tasks
                .purge_terminal(now - duration_to_ms(self.config.task_retention))
                .await?,
            leases_reset: self.tasks.reset_expired_leases(now).await?,
            buckets_purged: self
                .rate_limiter
                .as_ref()
                .map_or(0, |limiter| limiter.purge_idle() as u64),
        };

        if report != MaintenanceReport::default() {
            info!(
                codes_purged = report.codes_purged,
                tasks_purged = report.tasks_purged,
                leases_reset = report.leases_reset,
                buckets_purged = report.buckets_purged,
                "Database maintenance completed"
            );
        } else {
            debug!("Database maintenance completed, nothing to do");
        }

        Ok(report)
    }
}
