//! Worker pool draining the delivery queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::pipeline::DeliveryPipeline;
use crate::database::time::{now_ms, until_ms};

/// Configuration for the delivery worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Maximum concurrent workers.
    pub max_workers: usize,
    /// A single pass over a task is cut off after this long. The task stays
    /// claimed until its lease runs out.
    pub job_timeout: Duration,
    /// Longest an idle worker sleeps before checking the queue again.
    pub poll_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            job_timeout: Duration::from_secs(10 * 60),
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl WorkerPoolConfig {
    pub fn validate(&self, lease: Duration) -> crate::Result<()> {
        if self.max_workers == 0 {
            return Err(crate::Error::config("delivery workers must be at least 1"));
        }
        if self.job_timeout >= lease {
            return Err(crate::Error::config(
                "delivery job timeout must be shorter than the claim lease",
            ));
        }
        Ok(())
    }
}

/// A fixed set of workers calling [`DeliveryPipeline::process_next`].
pub struct WorkerPool {
    config: WorkerPoolConfig,
    semaphore: Arc<Semaphore>,
    active_workers: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self::with_token(config, CancellationToken::new())
    }

    /// Pool that also stops when `parent` is cancelled.
    pub fn with_token(config: WorkerPoolConfig, parent: CancellationToken) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_workers.max(1))),
            config,
            active_workers: Arc::new(AtomicUsize::new(0)),
            cancellation_token: parent.child_token(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    pub fn start(&self, pipeline: Arc<DeliveryPipeline>) {
        let poll_interval = self.config.poll_interval;
        let job_timeout = self.config.job_timeout;

        info!(
            max_workers = self.config.max_workers,
            "Starting delivery worker pool"
        );

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            warn!("Delivery worker pool already stopped");
            return;
        };

        for i in 0..self.config.max_workers.max(1) {
            let semaphore = self.semaphore.clone();
            let active = self.active_workers.clone();
            let cancellation_token = self.cancellation_token.clone();
            let pipeline = pipeline.clone();
            let notifier = pipeline.notifier();

            join_set.spawn(async move {
                debug!(worker = i, "Delivery worker started");

                loop {
                    if cancellation_token.is_cancelled() {
                        break;
                    }

                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };

                    active.fetch_add(1, Ordering::SeqCst);
                    let result = tokio::select! {
                        _ = cancellation_token.cancelled() => None,
                        result = tokio::time::timeout(job_timeout, pipeline.process_next()) => Some(result),
                    };
                    active.fetch_sub(1, Ordering::SeqCst);
                    drop(permit);

                    let busy = match result {
                        None => break,
                        Some(Ok(Ok(Some(processed)))) => {
                            debug!(
                                worker = i,
                                task_id = %processed.task_id,
                                outcome = ?processed.outcome,
                                "Delivery pass finished"
                            );
                            true
                        }
                        Some(Ok(Ok(None))) => false,
                        Some(Ok(Err(e))) => {
                            error!(worker = i, error = %e, "Delivery pass failed");
                            false
                        }
                        Some(Err(_)) => {
                            warn!(worker = i, ?job_timeout, "Delivery pass timed out");
                            false
                        }
                    };

                    if busy {
                        continue;
                    }

                    // Idle: sleep until the next parked task is due, a new
                    // submission arrives, or the poll interval elapses.
                    let wait = match pipeline.next_due_at().await {
                        Ok(Some(due)) => until_ms(due, now_ms()).min(poll_interval),
                        Ok(None) => poll_interval,
                        Err(e) => {
                            warn!(worker = i, error = %e, "Failed to read next due time");
                            poll_interval
                        }
                    };
                    if wait.is_zero() {
                        continue;
                    }

                    tokio::select! {
                        _ = cancellation_token.cancelled() => break,
                        _ = notifier.notified() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }

                debug!(worker = i, "Delivery worker stopped");
            });
        }
    }

    pub async fn stop(&self) {
        info!("Stopping delivery worker pool");
        self.cancellation_token.cancel();

        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!("Delivery worker pool stopped");
    }

    /// Workers currently inside a delivery pass.
    pub fn active_count(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}
