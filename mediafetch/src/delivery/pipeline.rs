//! Delivery pipeline: claim, fetch, transform, send.
//!
//! Each call to [`DeliveryPipeline::process_next`] takes one due task
//! through as many states as it can in a single pass:
//!
//! ```text
//! PENDING -> FETCHING -> PROCESSING -> DELIVERED
//!    ^          |             |
//!    +----------+-------------+   (parked: backoff, rate limit, open breaker)
//!
//! any non-terminal state -> FAILED
//! ```
//!
//! Every transition is a compare-and-set in the store, keyed on the claim
//! token handed out by the claim. If a write finds the task in a different
//! state or under another claim (cancelled, or reclaimed after the lease ran
//! out) the pass is abandoned without side effects.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast};
use tracing::{debug, info, instrument, warn};

use super::events::{DeliveryEvent, ParkReason};
use super::rate_limiter::{Acquire, RateLimiter};
use super::resilience::{CallError, CircuitBreakerManager, Dependency, RetryConfig};
use super::transform::{self, TransformConfig};
use crate::alert::{Alert, AlertSink, TracingAlertSink};
use crate::database::models::{
    DeactivationReason, DeliveryStatusCounts, DeliveryTaskDbModel, NewDeliveryTask,
};
use crate::database::repositories::{
    AttemptDelta, BindingRepository, Claim, DeliveryTaskRepository,
};
use crate::database::time::{duration_to_ms, now_ms};
use crate::domain::{DeliveryState, FailureReason};
use crate::platform::{DeliverySender, ItemRef, Payload, PayloadError, PayloadFetcher, SendError};
use crate::Result;

/// Pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Backoff policy. `max_retries` is copied onto each new task.
    pub retry: RetryConfig,
    /// How long a claim is honoured before maintenance hands the task back.
    pub lease: Duration,
    pub transform: TransformConfig,
    /// Consecutive terminal failures that deactivate a binding.
    pub binding_failure_threshold: u32,
    /// Buffered events per subscriber.
    pub event_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            lease: Duration::from_secs(15 * 60),
            transform: TransformConfig::default(),
            binding_failure_threshold: 5,
            event_capacity: 256,
        }
    }
}

/// Result of [`DeliveryPipeline::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Created(String),
    /// A live task for the pair exists, or the pair was already delivered.
    Duplicate,
}

impl SubmitOutcome {
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::Created(id) => Some(id),
            Self::Duplicate => None,
        }
    }
}

/// What one pass did with a claimed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Delivered { ack_id: String },
    Parked { until_ms: i64, reason: ParkReason },
    Failed(FailureReason),
    /// The task changed state under us.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Processed {
    pub task_id: String,
    pub outcome: ProcessOutcome,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Fetch,
    Send,
}

impl Phase {
    fn state(self) -> DeliveryState {
        match self {
            Self::Fetch => DeliveryState::Fetching,
            Self::Send => DeliveryState::Processing,
        }
    }

    fn delta(self) -> AttemptDelta {
        match self {
            Self::Fetch => AttemptDelta::FETCH,
            Self::Send => AttemptDelta::SEND,
        }
    }

    fn exhausted(self) -> FailureReason {
        match self {
            Self::Fetch => FailureReason::FetchExhausted,
            Self::Send => FailureReason::DeliveryExhausted,
        }
    }

    fn failures_so_far(self, task: &DeliveryTaskDbModel) -> i64 {
        match self {
            Self::Fetch => task.fetch_attempts,
            Self::Send => task.send_attempts,
        }
    }
}

/// Claimed rows always carry a token. An empty one matches nothing, so a row
/// without one is simply abandoned at its first transition.
fn claim_token(task: &DeliveryTaskDbModel) -> &str {
    task.claim_token.as_deref().unwrap_or_default()
}

pub struct DeliveryPipeline {
    tasks: Arc<dyn DeliveryTaskRepository>,
    bindings: Arc<dyn BindingRepository>,
    payloads: Arc<dyn PayloadFetcher>,
    sender: Arc<dyn DeliverySender>,
    breakers: Arc<CircuitBreakerManager>,
    rate_limiter: Arc<RateLimiter>,
    alerts: Arc<dyn AlertSink>,
    config: PipelineConfig,
    notify: Arc<Notify>,
    events: broadcast::Sender<DeliveryEvent>,
}

impl DeliveryPipeline {
    pub fn new(
        tasks: Arc<dyn DeliveryTaskRepository>,
        bindings: Arc<dyn BindingRepository>,
        payloads: Arc<dyn PayloadFetcher>,
        sender: Arc<dyn DeliverySender>,
        config: PipelineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            tasks,
            bindings,
            payloads,
            sender,
            breakers: Arc::new(CircuitBreakerManager::default()),
            rate_limiter: Arc::new(RateLimiter::default()),
            alerts: Arc::new(TracingAlertSink),
            config,
            notify: Arc::new(Notify::new()),
            events,
        }
    }

    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerManager>) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    /// Woken on every new submission.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.events.subscribe()
    }

    /// Enqueue a task. Duplicates are a successful no-op.
    pub async fn submit(&self, task: NewDeliveryTask) -> Result<SubmitOutcome> {
        let now = now_ms();
        match self.tasks.insert_if_absent(&task, now).await? {
            Some(id) => {
                debug!(
                    task_id = %id,
                    binding_id = task.binding_id,
                    item_id = %task.item_id,
                    "Delivery task created"
                );
                let _ = self.events.send(DeliveryEvent {
                    task_id: id.clone(),
                    binding_id: task.binding_id,
                    item_id: task.item_id.clone(),
                    state: DeliveryState::Pending,
                    failure_reason: None,
                    park_reason: None,
                    next_attempt_at: Some(task.not_before),
                    timestamp: Utc::now(),
                });
                self.notify.notify_one();
                Ok(SubmitOutcome::Created(id))
            }
            None => {
                debug!(
                    binding_id = task.binding_id,
                    item_id = %task.item_id,
                    "Duplicate delivery task ignored"
                );
                Ok(SubmitOutcome::Duplicate)
            }
        }
    }

    /// Claim the oldest due task and run it as far as it goes.
    /// Returns `None` if nothing is due.
    pub async fn process_next(&self) -> Result<Option<Processed>> {
        let lease_ms = duration_to_ms(self.config.lease);
        let Some(task) = self.tasks.claim_next(now_ms(), lease_ms).await? else {
            return Ok(None);
        };
        self.emit(DeliveryEvent::new(&task, DeliveryState::Fetching));

        let outcome = self.run(&task).await?;
        Ok(Some(Processed {
            task_id: task.id.clone(),
            outcome,
        }))
    }

    /// Fail a task from whatever live state it is in. Returns `false` if it
    /// had already reached a terminal state.
    pub async fn cancel(&self, task_id: &str) -> Result<bool> {
        let task = self.tasks.get_task(task_id).await?;
        let cancelled = self
            .tasks
            .mark_failed(
                task_id,
                None,
                FailureReason::Cancelled,
                AttemptDelta::NONE,
                "cancelled",
                now_ms(),
            )
            .await?;
        if cancelled {
            info!(task_id, "Delivery task cancelled");
            self.emit(DeliveryEvent::failed(&task, FailureReason::Cancelled));
        }
        Ok(cancelled)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<DeliveryTaskDbModel> {
        self.tasks.get_task(task_id).await
    }

    /// Most recent tasks for a binding, newest first.
    pub async fn list_tasks_for_binding(
        &self,
        binding_id: i64,
        limit: i64,
    ) -> Result<Vec<DeliveryTaskDbModel>> {
        self.tasks.list_for_binding(binding_id, limit).await
    }

    pub async fn status_counts(&self) -> Result<DeliveryStatusCounts> {
        self.tasks.status_counts().await
    }

    /// Earliest `next_attempt_at` among pending tasks.
    pub async fn next_due_at(&self) -> Result<Option<i64>> {
        self.tasks.next_due_at().await
    }

    #[instrument(skip_all, fields(task_id = %task.id, item_id = %task.item_id))]
    async fn run(&self, task: &DeliveryTaskDbModel) -> Result<ProcessOutcome> {
        let Some(kind) = task.kind() else {
            let error = format!("unknown content kind '{}'", task.content_kind);
            return self
                .fail(
                    task,
                    DeliveryState::Fetching,
                    FailureReason::PayloadRejected,
                    AttemptDelta::NONE,
                    error,
                )
                .await;
        };

        // A recipient out of budget would only throw the download away.
        // The token itself is taken right before the send.
        let recipient = task.recipient();
        if let Some(retry_after) = self.rate_limiter.retry_after(&recipient) {
            return self
                .park(
                    task,
                    DeliveryState::Fetching,
                    retry_after,
                    AttemptDelta::NONE,
                    ParkReason::RateLimited,
                    format!("recipient {recipient} rate limited"),
                )
                .await;
        }

        // Fetch
        let payload = if kind.has_binary_payload() {
            let item = ItemRef {
                source_id: task.source(),
                item_id: task.item_id.clone(),
                kind,
                payload_ref: task.payload_ref.clone(),
            };
            let breaker = self.breakers.get(Dependency::SourcePlatform);
            match breaker
                .call(PayloadError::is_retryable, || self.payloads.fetch_payload(&item))
                .await
            {
                Ok(payload) => payload,
                Err(CallError::Unavailable(e)) => {
                    return self
                        .park(
                            task,
                            DeliveryState::Fetching,
                            e.retry_after,
                            AttemptDelta::NONE,
                            ParkReason::BreakerOpen,
                            e.to_string(),
                        )
                        .await;
                }
                Err(CallError::Inner(PayloadError::NotFound)) => {
                    return self
                        .fail(
                            task,
                            DeliveryState::Fetching,
                            FailureReason::ContentGone,
                            AttemptDelta::NONE,
                            PayloadError::NotFound.to_string(),
                        )
                        .await;
                }
                Err(CallError::Inner(e @ PayloadError::TooLarge { .. })) => {
                    return self
                        .fail(
                            task,
                            DeliveryState::Fetching,
                            FailureReason::PayloadRejected,
                            AttemptDelta::NONE,
                            e.to_string(),
                        )
                        .await;
                }
                Err(CallError::Inner(e)) => {
                    return self.retry_or_fail(task, Phase::Fetch, e.to_string()).await;
                }
            }
        } else {
            Payload::empty(kind)
        };

        if !self
            .tasks
            .mark_processing(&task.id, claim_token(task), now_ms())
            .await?
        {
            return Ok(self.abandoned(task, DeliveryState::Processing));
        }
        self.emit(DeliveryEvent::new(task, DeliveryState::Processing));

        // Transform
        let preferences = match self.bindings.get_binding(task.binding_id).await {
            Ok(binding) => binding.preferences(),
            Err(e) => {
                warn!(binding_id = task.binding_id, error = %e, "Binding lookup failed, using default preferences");
                Default::default()
            }
        };
        let prepared = match transform::prepare(
            task,
            kind,
            payload,
            &preferences,
            &self.config.transform,
        ) {
            Ok(prepared) => prepared,
            Err(e) => {
                return self
                    .fail(
                        task,
                        DeliveryState::Processing,
                        FailureReason::PayloadRejected,
                        AttemptDelta::NONE,
                        e.to_string(),
                    )
                    .await;
            }
        };

        // Send. The breaker is checked before the rate limiter so a fast-fail
        // does not burn a send token.
        let breaker = self.breakers.get(Dependency::DestinationPlatform);
        let permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(e) => {
                return self
                    .park(
                        task,
                        DeliveryState::Processing,
                        e.retry_after,
                        AttemptDelta::NONE,
                        ParkReason::BreakerOpen,
                        e.to_string(),
                    )
                    .await;
            }
        };

        if let Acquire::Limited { retry_after } = self.rate_limiter.try_acquire(&recipient) {
            drop(permit);
            return self
                .park(
                    task,
                    DeliveryState::Processing,
                    retry_after,
                    AttemptDelta::NONE,
                    ParkReason::RateLimited,
                    format!("recipient {recipient} rate limited"),
                )
                .await;
        }

        let result = self
            .sender
            .send(&recipient, &prepared.payload, &prepared.metadata)
            .await;

        match result {
            Ok(ack) => {
                permit.success();
                self.delivered(task, ack.message_id).await
            }
            Err(e) => {
                if e.is_retryable() {
                    permit.failure();
                } else {
                    permit.success();
                }
                match e {
                    SendError::RecipientInvalid(msg) => {
                        self.fail(
                            task,
                            DeliveryState::Processing,
                            FailureReason::RecipientInvalid,
                            AttemptDelta::SEND,
                            msg,
                        )
                        .await
                    }
                    SendError::PayloadRejected(msg) => {
                        self.fail(
                            task,
                            DeliveryState::Processing,
                            FailureReason::PayloadRejected,
                            AttemptDelta::SEND,
                            msg,
                        )
                        .await
                    }
                    e @ SendError::Unreachable(_) => {
                        self.retry_or_fail(task, Phase::Send, e.to_string()).await
                    }
                }
            }
        }
    }

    async fn delivered(&self, task: &DeliveryTaskDbModel, ack_id: String) -> Result<ProcessOutcome> {
        let now = now_ms();
        if !self
            .tasks
            .mark_delivered(&task.id, claim_token(task), &ack_id, now)
            .await?
        {
            // Sent but the record moved on; the ack is logged for reconciliation.
            warn!(task_id = %task.id, ack_id = %ack_id, "Delivered task no longer in PROCESSING");
            return Ok(ProcessOutcome::Abandoned);
        }
        info!(
            task_id = %task.id,
            recipient = %task.recipient_id,
            item_id = %task.item_id,
            ack_id = %ack_id,
            "Delivered"
        );
        if let Err(e) = self.bindings.record_delivery_success(task.binding_id, now).await {
            warn!(binding_id = task.binding_id, error = %e, "Failed to record binding activity");
        }
        self.emit(DeliveryEvent::new(task, DeliveryState::Delivered));
        Ok(ProcessOutcome::Delivered { ack_id })
    }

    /// Back off or give up, depending on the phase's failure count.
    async fn retry_or_fail(
        &self,
        task: &DeliveryTaskDbModel,
        phase: Phase,
        error: String,
    ) -> Result<ProcessOutcome> {
        let failures = u32::try_from(phase.failures_so_far(task) + 1).unwrap_or(u32::MAX);
        let retry = RetryConfig {
            max_retries: u32::try_from(task.max_retries).unwrap_or(0),
            ..self.config.retry.clone()
        };

        if retry.should_retry(failures) {
            let delay = retry.delay_for_attempt(failures);
            debug!(
                task_id = %task.id,
                ?phase,
                failures,
                ?delay,
                error = %error,
                "Retryable delivery error"
            );
            self.park(task, phase.state(), delay, phase.delta(), ParkReason::Backoff, error)
                .await
        } else {
            self.fail(task, phase.state(), phase.exhausted(), phase.delta(), error)
                .await
        }
    }

    async fn park(
        &self,
        task: &DeliveryTaskDbModel,
        from: DeliveryState,
        delay: Duration,
        delta: AttemptDelta,
        reason: ParkReason,
        error: String,
    ) -> Result<ProcessOutcome> {
        let now = now_ms();
        let until_ms = now.saturating_add(duration_to_ms(delay));
        if !self
            .tasks
            .park(
                &task.id,
                Claim::new(from, claim_token(task)),
                until_ms,
                delta,
                Some(&error),
                now,
            )
            .await?
        {
            return Ok(self.abandoned(task, DeliveryState::Pending));
        }
        debug!(task_id = %task.id, %reason, ?delay, "Delivery task parked");
        self.emit(DeliveryEvent::parked(task, reason, until_ms));
        Ok(ProcessOutcome::Parked { until_ms, reason })
    }

    async fn fail(
        &self,
        task: &DeliveryTaskDbModel,
        from: DeliveryState,
        reason: FailureReason,
        delta: AttemptDelta,
        error: String,
    ) -> Result<ProcessOutcome> {
        let now = now_ms();
        if !self
            .tasks
            .mark_failed(
                &task.id,
                Some(Claim::new(from, claim_token(task))),
                reason,
                delta,
                &error,
                now,
            )
            .await?
        {
            return Ok(self.abandoned(task, DeliveryState::Failed));
        }
        warn!(
            task_id = %task.id,
            recipient = %task.recipient_id,
            item_id = %task.item_id,
            %reason,
            error = %error,
            "Delivery failed"
        );
        self.emit(DeliveryEvent::failed(task, reason));
        self.alerts
            .alert(Alert::DeliveryFailed {
                task_id: task.id.clone(),
                binding_id: task.binding_id,
                recipient_id: task.recipient(),
                item_id: task.item_id.clone(),
                reason,
                error,
            })
            .await;

        if reason.counts_against_binding() {
            self.record_binding_failure(task, now).await;
        }
        Ok(ProcessOutcome::Failed(reason))
    }

    async fn record_binding_failure(&self, task: &DeliveryTaskDbModel, now: i64) {
        let threshold = i64::from(self.config.binding_failure_threshold.max(1));
        match self
            .bindings
            .record_delivery_failure(task.binding_id, threshold, now)
            .await
        {
            Ok(true) => {
                warn!(binding_id = task.binding_id, "Binding deactivated after repeated delivery failures");
                self.alerts
                    .alert(Alert::BindingDeactivated {
                        binding_id: task.binding_id,
                        source_id: task.source(),
                        recipient_id: task.recipient(),
                        reason: DeactivationReason::DeliveryFailures,
                    })
                    .await;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(binding_id = task.binding_id, error = %e, "Failed to record binding failure");
            }
        }
    }

    fn abandoned(&self, task: &DeliveryTaskDbModel, target: DeliveryState) -> ProcessOutcome {
        debug!(task_id = %task.id, %target, "Task changed state concurrently, abandoning");
        ProcessOutcome::Abandoned
    }

    fn emit(&self, event: DeliveryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
