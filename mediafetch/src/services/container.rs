//! Service container.
//!
//! Builds every service from an [`AppConfig`] and the platform collaborators,
//! and owns their background tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alert::{Alert, AlertSink, BroadcastAlertSink, FanOutAlertSink, TracingAlertSink, WebhookAlertSink};
use crate::config::AppConfig;
use crate::database::repositories::{
    DeliveryTaskRepository, SqlxBindingRepository, SqlxDeliveryTaskRepository,
    SqlxPairingCodeRepository, SqlxSourceRepository,
};
use crate::database::time::now_ms;
use crate::database::{DbPool, MaintenanceScheduler};
use crate::delivery::{CircuitBreakerManager, DeliveryPipeline, RateLimiter, WorkerPool};
use crate::monitor::{ContentMonitor, DedupCache};
use crate::platform::{DeliverySender, PayloadFetcher, SourceFetcher};
use crate::registry::BindingRegistry;
use crate::Result;

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Alert subscribers may lag this far behind before dropping alerts.
const ALERT_CHANNEL_CAPACITY: usize = 256;

/// The three platform-facing traits.
#[derive(Clone)]
pub struct Collaborators {
    pub source_fetcher: Arc<dyn SourceFetcher>,
    pub payload_fetcher: Arc<dyn PayloadFetcher>,
    pub sender: Arc<dyn DeliverySender>,
}

pub struct ServiceContainer {
    pub pool: DbPool,
    pub registry: Arc<BindingRegistry>,
    pub pipeline: Arc<DeliveryPipeline>,
    pub monitor: Arc<ContentMonitor>,
    pub breakers: Arc<CircuitBreakerManager>,
    pub rate_limiter: Arc<RateLimiter>,
    tasks: Arc<dyn DeliveryTaskRepository>,
    alerts: Arc<dyn AlertSink>,
    alert_broadcast: Arc<BroadcastAlertSink>,
    worker_pool: WorkerPool,
    maintenance: Arc<MaintenanceScheduler>,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    pub fn new(pool: DbPool, config: &AppConfig, collaborators: Collaborators) -> Result<Self> {
        info!("Initializing service container");

        let codes = Arc::new(SqlxPairingCodeRepository::new(pool.clone()));
        let bindings = Arc::new(SqlxBindingRepository::new(pool.clone()));
        let sources = Arc::new(SqlxSourceRepository::new(pool.clone()));
        let tasks: Arc<dyn DeliveryTaskRepository> =
            Arc::new(SqlxDeliveryTaskRepository::new(pool.clone()));

        let alert_broadcast = Arc::new(BroadcastAlertSink::new(ALERT_CHANNEL_CAPACITY));
        let mut fan_out = FanOutAlertSink::new()
            .with(Arc::new(TracingAlertSink))
            .with(alert_broadcast.clone());
        if let Some(webhook) = &config.webhook_alerts {
            fan_out = fan_out.with(Arc::new(WebhookAlertSink::new(webhook.clone())?));
            info!(url = %webhook.url, "Webhook alerts enabled");
        }
        let alerts: Arc<dyn AlertSink> = Arc::new(fan_out);

        let breakers = Arc::new(CircuitBreakerManager::new(config.breaker.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let cancellation_token = CancellationToken::new();

        let pipeline = Arc::new(
            DeliveryPipeline::new(
                tasks.clone(),
                bindings.clone(),
                collaborators.payload_fetcher,
                collaborators.sender,
                config.pipeline.clone(),
            )
            .with_breakers(breakers.clone())
            .with_rate_limiter(rate_limiter.clone())
            .with_alert_sink(alerts.clone()),
        );

        let monitor = Arc::new(
            ContentMonitor::new(
                sources,
                bindings.clone(),
                collaborators.source_fetcher,
                pipeline.clone(),
                config.monitor.clone(),
            )
            .with_dedup_cache(Arc::new(DedupCache::new(config.dedup.clone())))
            .with_alert_sink(alerts.clone())
            .with_cancellation(&cancellation_token),
        );

        let registry = Arc::new(
            BindingRegistry::new(codes.clone(), bindings, config.registry.clone())
                .with_alert_sink(alerts.clone()),
        );

        let maintenance = Arc::new(
            MaintenanceScheduler::with_repositories(codes, tasks.clone(), config.maintenance.clone())
                .with_rate_limiter(rate_limiter.clone()),
        );

        let worker_pool = WorkerPool::with_token(config.workers.clone(), cancellation_token.clone());

        Ok(Self {
            pool,
            registry,
            pipeline,
            monitor,
            breakers,
            rate_limiter,
            tasks,
            alerts,
            alert_broadcast,
            worker_pool,
            maintenance,
            background: parking_lot::Mutex::new(Vec::new()),
            cancellation_token,
        })
    }

    /// Recover claims whose lease ran out, then start the workers, the
    /// monitor and the maintenance sweep. Live claims held by another
    /// instance sharing the store are left alone.
    pub async fn start(&self) -> Result<()> {
        let recovered = self.tasks.reset_expired_leases(now_ms()).await?;
        if recovered > 0 {
            info!(recovered, "Recovered delivery claims with expired leases");
        }

        self.worker_pool.start(self.pipeline.clone());

        let mut background = self.background.lock();
        background.push(self.monitor.clone().start());
        background.push(
            self.maintenance
                .clone()
                .start(self.cancellation_token.child_token()),
        );
        background.push(self.forward_breaker_transitions());

        info!("Services started");
        Ok(())
    }

    /// Raise an alert for every breaker state change.
    fn forward_breaker_transitions(&self) -> JoinHandle<()> {
        let mut receiver = self.breakers.subscribe();
        let alerts = self.alerts.clone();
        let cancellation_token = self.cancellation_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        debug!("Breaker transition forwarder shutting down");
                        break;
                    }
                    result = receiver.recv() => match result {
                        Ok(transition) => {
                            alerts
                                .alert(Alert::BreakerStateChanged {
                                    dependency: transition.dependency,
                                    from: transition.from,
                                    to: transition.to,
                                })
                                .await;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Breaker transition forwarder lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alert_broadcast.subscribe()
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        info!(?timeout, "Shutting down services");
        self.cancellation_token.cancel();

        let background = std::mem::take(&mut *self.background.lock());
        let drained = tokio::time::timeout(timeout, async {
            self.worker_pool.stop().await;
            for handle in background {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Background task ended abnormally");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!("Shutdown timeout reached, forcing shutdown");
        }

        info!("Closing database pool...");
        self.pool.close().await;

        info!("Services shut down");
        Ok(())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
