//! Content monitor service.
//!
//! A supervisor reloads the enabled sources from the store every cycle and
//! keeps exactly one polling task per source. Each poll takes the source's
//! async mutex, so [`ContentMonitor::poll_now`] never overlaps a scheduled
//! check.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::dedup::DedupCache;
use crate::Result;
use crate::alert::{Alert, AlertSink, TracingAlertSink};
use crate::database::models::NewDeliveryTask;
use crate::database::repositories::{BindingRepository, SourceRepository};
use crate::database::time::{duration_to_ms, now_ms, until_ms};
use crate::delivery::resilience::{CallError, CircuitBreakerManager, Dependency};
use crate::delivery::{DeliveryPipeline, SubmitOutcome};
use crate::domain::{ContentItem, Cursor, SourceId};
use crate::platform::{FetchError, SourceFetcher};

/// Configuration for the content monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Poll interval for sources registered without one.
    pub default_poll_interval: Duration,
    /// How often the supervisor re-reads the source list.
    pub supervisor_interval: Duration,
    /// Wait after a poll that failed on the store rather than the platform.
    pub error_backoff: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            default_poll_interval: Duration::from_secs(300),
            supervisor_interval: Duration::from_secs(30),
            error_backoff: Duration::from_secs(30),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_poll_interval.is_zero() {
            return Err(crate::Error::config("poll interval must be positive"));
        }
        if self.supervisor_interval.is_zero() {
            return Err(crate::Error::config("supervisor interval must be positive"));
        }
        Ok(())
    }
}

/// How a poll ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    /// Every new item was submitted.
    Completed,
    /// A submission failed; later items wait for the next poll.
    Partial { error: String },
    /// The source platform call failed; the cursor did not move.
    FetchFailed { error: String, consecutive_failures: i64 },
    /// The source platform breaker is open; nothing was attempted.
    Deferred { retry_after: Duration },
}

/// Summary of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub source_id: SourceId,
    pub fetched: usize,
    /// Items not already in the dedup cache.
    pub new_items: usize,
    pub tasks_created: usize,
    pub duplicates: usize,
    /// Cursor after the poll.
    pub cursor: Option<Cursor>,
    pub status: PollStatus,
}

impl PollReport {
    fn new(source_id: SourceId, cursor: Option<Cursor>) -> Self {
        Self {
            source_id,
            fetched: 0,
            new_items: 0,
            tasks_created: 0,
            duplicates: 0,
            cursor,
            status: PollStatus::Completed,
        }
    }
}

#[derive(Debug, Default)]
struct FanOut {
    created: usize,
    duplicates: usize,
}

/// Handle to a running per-source polling task.
#[derive(Debug)]
struct SourceTask {
    cancellation_token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ContentMonitor {
    sources: Arc<dyn SourceRepository>,
    bindings: Arc<dyn BindingRepository>,
    fetcher: Arc<dyn SourceFetcher>,
    pipeline: Arc<DeliveryPipeline>,
    dedup: Arc<DedupCache>,
    breakers: Arc<CircuitBreakerManager>,
    alerts: Arc<dyn AlertSink>,
    config: MonitorConfig,
    locks: DashMap<SourceId, Arc<Mutex<()>>>,
    tasks: DashMap<SourceId, SourceTask>,
    refresh: Notify,
    cancellation_token: CancellationToken,
}

impl ContentMonitor {
    pub fn new(
        sources: Arc<dyn SourceRepository>,
        bindings: Arc<dyn BindingRepository>,
        fetcher: Arc<dyn SourceFetcher>,
        pipeline: Arc<DeliveryPipeline>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            sources,
            bindings,
            fetcher,
            breakers: pipeline.breakers().clone(),
            pipeline,
            dedup: Arc::new(DedupCache::default()),
            alerts: Arc::new(TracingAlertSink),
            config,
            locks: DashMap::new(),
            tasks: DashMap::new(),
            refresh: Notify::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn with_dedup_cache(mut self, dedup: Arc<DedupCache>) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Stop together with `parent`.
    pub fn with_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.cancellation_token = parent.child_token();
        self
    }

    pub fn dedup_cache(&self) -> &Arc<DedupCache> {
        &self.dedup
    }

    /// Number of sources with a running polling task.
    pub fn active_source_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }

    /// Start monitoring `source`, or update its poll interval. The handle
    /// goes through [`SourceId::parse`] first.
    /// Returns `true` if the source was new.
    pub async fn register_source(
        &self,
        source: &SourceId,
        poll_interval: Option<Duration>,
    ) -> Result<bool> {
        let source = &SourceId::parse(source.as_str())?;
        let interval = poll_interval.unwrap_or(self.config.default_poll_interval);
        let interval_ms = duration_to_ms(interval);
        if interval_ms <= 0 {
            return Err(crate::Error::validation("poll interval must be positive"));
        }

        let created = self
            .sources
            .ensure_source(source.as_str(), interval_ms, now_ms())
            .await?;
        if !created && poll_interval.is_some() {
            self.sources
                .set_poll_interval(source.as_str(), interval_ms)
                .await?;
        }
        info!(source = %source, created, ?interval, "Source registered");
        self.refresh.notify_one();
        Ok(created)
    }

    pub async fn set_monitoring_enabled(&self, source: &SourceId, enabled: bool) -> Result<()> {
        self.sources.set_enabled(source.as_str(), enabled).await?;
        if !enabled {
            self.stop_source_task(source);
        }
        info!(source = %source, enabled, "Monitoring toggled");
        self.refresh.notify_one();
        Ok(())
    }

    /// Check a source right away, waiting for any scheduled check to finish.
    pub async fn poll_now(&self, source: &SourceId) -> Result<PollReport> {
        self.poll_source(source).await
    }

    /// Fetch new items for `source` and fan them out to its bindings.
    #[instrument(skip_all, fields(source = %source))]
    pub async fn poll_source(&self, source: &SourceId) -> Result<PollReport> {
        let lock = self
            .locks
            .entry(source.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let row = self.sources.get_source(source.as_str()).await?;
        let since = row.cursor();
        let mut report = PollReport::new(source.clone(), since.clone());

        let breaker = self.breakers.get(Dependency::SourcePlatform);
        let fetched = breaker
            .call(FetchError::is_dependency_failure, || {
                self.fetcher.fetch_new_items(source, since.as_ref())
            })
            .await;

        let mut items = match fetched {
            Ok(items) => items,
            Err(CallError::Unavailable(e)) => {
                debug!(retry_after = ?e.retry_after, "Source platform breaker open, deferring poll");
                report.status = PollStatus::Deferred {
                    retry_after: e.retry_after,
                };
                return Ok(report);
            }
            Err(CallError::Inner(e)) => {
                return self.record_fetch_failure(source, e, report).await;
            }
        };

        report.fetched = items.len();
        items.sort_by_key(ContentItem::cursor);

        let mut last_done: Option<Cursor> = None;
        for item in &items {
            let cursor = item.cursor();
            if since.as_ref().is_some_and(|since| cursor <= *since) {
                // Already behind the cursor.
                continue;
            }

            if self.dedup.seen(source, &item.item_id) {
                last_done = Some(cursor);
                continue;
            }
            report.new_items += 1;

            match self.fan_out(item).await {
                Ok(fan_out) => {
                    report.tasks_created += fan_out.created;
                    report.duplicates += fan_out.duplicates;
                    last_done = Some(cursor);
                }
                Err(e) => {
                    // Let the next poll see this item again.
                    self.dedup.forget(source, &item.item_id);
                    warn!(item_id = %item.item_id, error = %e, "Submission failed, stopping batch");
                    report.status = PollStatus::Partial {
                        error: e.to_string(),
                    };
                    break;
                }
            }
        }

        if let Some(cursor) = last_done {
            if self.sources.advance_cursor(source.as_str(), &cursor).await? {
                debug!(position = cursor.position, item_id = %cursor.item_id, "Cursor advanced");
            }
            report.cursor = Some(cursor);
        }
        self.sources.mark_checked(source.as_str(), now_ms()).await?;

        if report.new_items > 0 {
            info!(
                fetched = report.fetched,
                new_items = report.new_items,
                tasks_created = report.tasks_created,
                "Source poll finished"
            );
        }
        Ok(report)
    }

    async fn record_fetch_failure(
        &self,
        source: &SourceId,
        error: FetchError,
        mut report: PollReport,
    ) -> Result<PollReport> {
        let message = error.to_string();
        let consecutive_failures = self
            .sources
            .record_poll_failure(source.as_str(), &message, now_ms())
            .await?;
        warn!(
            error = %message,
            consecutive_failures,
            retryable = error.is_retryable(),
            "Source poll failed"
        );
        self.alerts
            .alert(Alert::SourceFetchFailed {
                source_id: source.clone(),
                error: message.clone(),
                consecutive_failures,
            })
            .await;
        report.status = PollStatus::FetchFailed {
            error: message,
            consecutive_failures,
        };
        Ok(report)
    }

    /// One task per active binding whose preferences accept the item.
    async fn fan_out(&self, item: &ContentItem) -> Result<FanOut> {
        let bindings = self
            .bindings
            .list_active_for_source(item.source_id.as_str())
            .await?;
        let max_retries = self.pipeline.config().retry.max_retries;
        let mut result = FanOut::default();

        for binding in bindings {
            let preferences = binding.preferences();
            if !preferences.accepts(item.kind) {
                continue;
            }
            let not_before = preferences
                .cadence
                .next_slot(Utc::now())
                .timestamp_millis();

            let task = NewDeliveryTask {
                binding_id: binding.id,
                source_id: item.source_id.clone(),
                recipient_id: binding.recipient(),
                item_id: item.item_id.clone(),
                kind: item.kind,
                payload_ref: item.payload_ref.clone(),
                caption: item.caption.clone(),
                permalink: item.permalink.clone(),
                max_retries,
                not_before,
            };
            match self.pipeline.submit(task).await? {
                SubmitOutcome::Created(_) => result.created += 1,
                SubmitOutcome::Duplicate => result.duplicates += 1,
            }
        }
        Ok(result)
    }

    /// Run the supervisor until cancelled.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Content monitor started");
            loop {
                if let Err(e) = self.reconcile_tasks().await {
                    warn!(error = %e, "Failed to refresh monitored sources");
                }

                tokio::select! {
                    _ = self.cancellation_token.cancelled() => break,
                    _ = self.refresh.notified() => {}
                    _ = tokio::time::sleep(self.config.supervisor_interval) => {}
                }

                let purged = self.dedup.purge_expired();
                if purged > 0 {
                    debug!(purged, "Expired dedup entries purged");
                }
            }
            self.stop_all().await;
            info!("Content monitor stopped");
        })
    }

    pub fn stop(&self) {
        self.cancellation_token.cancel();
    }

    /// Spawn tasks for newly enabled sources, drop tasks for the rest.
    async fn reconcile_tasks(self: &Arc<Self>) -> Result<()> {
        let enabled = self.sources.list_enabled().await?;

        self.tasks.retain(|source, task| {
            let keep = !task.handle.is_finished()
                && enabled.iter().any(|row| row.source_id == source.as_str());
            if !keep {
                task.cancellation_token.cancel();
            }
            keep
        });

        for row in enabled {
            let source = row.source();
            if self.tasks.contains_key(&source) {
                continue;
            }
            let token = self.cancellation_token.child_token();
            let handle = tokio::spawn(self.clone().run_source(source.clone(), token.clone()));
            self.tasks.insert(
                source,
                SourceTask {
                    cancellation_token: token,
                    handle,
                },
            );
        }
        Ok(())
    }

    async fn run_source(self: Arc<Self>, source: SourceId, token: CancellationToken) {
        debug!(source = %source, "Source task started");
        loop {
            let wait = match self.sources.get_source(source.as_str()).await {
                Ok(row) if !row.enabled => break,
                Ok(row) => until_ms(row.next_check_at(), now_ms()),
                Err(e) => {
                    warn!(source = %source, error = %e, "Failed to load source");
                    self.config.error_backoff
                }
            };

            if !wait.is_zero() {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                continue;
            }

            let backoff = match self.poll_source(&source).await {
                Ok(PollReport {
                    status: PollStatus::Deferred { retry_after },
                    ..
                }) => Some(retry_after.max(Duration::from_secs(1))),
                Ok(_) => None,
                Err(e) => {
                    warn!(source = %source, error = %e, "Source poll aborted");
                    Some(self.config.error_backoff)
                }
            };

            if let Some(backoff) = backoff {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            if token.is_cancelled() {
                break;
            }
        }
        debug!(source = %source, "Source task stopped");
    }

    fn stop_source_task(&self, source: &SourceId) {
        if let Some((_, task)) = self.tasks.remove(source) {
            task.cancellation_token.cancel();
        }
    }

    async fn stop_all(&self) {
        let sources: Vec<SourceId> = self.tasks.iter().map(|e| e.key().clone()).collect();
        for source in sources {
            if let Some((_, task)) = self.tasks.remove(&source) {
                task.cancellation_token.cancel();
                if let Err(e) = task.handle.await {
                    warn!(source = %source, error = %e, "Source task ended abnormally");
                }
            }
        }
    }
}
