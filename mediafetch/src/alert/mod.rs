//! Operator alerts.
//!
//! The core reports noteworthy failures through [`AlertSink`] and never
//! waits on or fails because of the sink. Sinks provided here log through
//! `tracing`, publish on a broadcast channel, or POST JSON to a webhook;
//! [`FanOutAlertSink`] combines them.

mod webhook;

pub use webhook::{WebhookAlertConfig, WebhookAlertSink};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::database::models::DeactivationReason;
use crate::delivery::resilience::{CircuitState, Dependency};
use crate::domain::{FailureReason, RecipientId, SourceId};

/// Severity used by sinks to filter.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Something an operator may want to know about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Alert {
    /// Polling a source failed; the cursor was left alone.
    SourceFetchFailed {
        source_id: SourceId,
        error: String,
        consecutive_failures: i64,
    },
    /// A delivery task ended in `Failed`.
    DeliveryFailed {
        task_id: String,
        binding_id: i64,
        recipient_id: RecipientId,
        item_id: String,
        reason: FailureReason,
        error: String,
    },
    BindingDeactivated {
        binding_id: i64,
        source_id: SourceId,
        recipient_id: RecipientId,
        reason: DeactivationReason,
    },
    BreakerStateChanged {
        dependency: Dependency,
        from: CircuitState,
        to: CircuitState,
    },
}

impl Alert {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceFetchFailed { .. } => "source_fetch_failed",
            Self::DeliveryFailed { .. } => "delivery_failed",
            Self::BindingDeactivated { .. } => "binding_deactivated",
            Self::BreakerStateChanged { .. } => "breaker_state_changed",
        }
    }

    pub fn severity(&self) -> AlertSeverity {
        match self {
            Self::SourceFetchFailed {
                consecutive_failures,
                ..
            } if *consecutive_failures >= 3 => AlertSeverity::Critical,
            Self::SourceFetchFailed { .. } => AlertSeverity::Warning,
            Self::DeliveryFailed {
                reason: FailureReason::Cancelled,
                ..
            } => AlertSeverity::Info,
            Self::DeliveryFailed { .. } => AlertSeverity::Warning,
            Self::BindingDeactivated {
                reason: DeactivationReason::Revoked,
                ..
            } => AlertSeverity::Info,
            Self::BindingDeactivated { .. } => AlertSeverity::Critical,
            Self::BreakerStateChanged {
                to: CircuitState::Open,
                ..
            } => AlertSeverity::Critical,
            Self::BreakerStateChanged { .. } => AlertSeverity::Info,
        }
    }

    pub fn summary(&self) -> String {
        match self {
            Self::SourceFetchFailed {
                source_id, error, ..
            } => format!("polling {source_id} failed: {error}"),
            Self::DeliveryFailed {
                task_id, reason, ..
            } => format!("delivery {task_id} failed: {reason}"),
            Self::BindingDeactivated {
                binding_id, reason, ..
            } => format!("binding {binding_id} deactivated: {reason}"),
            Self::BreakerStateChanged {
                dependency,
                from,
                to,
            } => format!("{dependency} breaker {from} -> {to}"),
        }
    }
}

/// Alert with its emission time.
#[derive(Debug, Clone, Serialize)]
pub struct AlertEnvelope<'a> {
    pub kind: &'static str,
    pub severity: AlertSeverity,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
    pub alert: &'a Alert,
}

impl<'a> AlertEnvelope<'a> {
    pub fn new(alert: &'a Alert) -> Self {
        Self {
            kind: alert.kind(),
            severity: alert.severity(),
            summary: alert.summary(),
            timestamp: Utc::now(),
            alert,
        }
    }
}

/// Fire-and-forget alert boundary.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver an alert. Implementations swallow and log their own errors.
    async fn alert(&self, alert: Alert);
}

/// Writes alerts to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn alert(&self, alert: Alert) {
        let summary = alert.summary();
        match alert.severity() {
            AlertSeverity::Info => info!(kind = alert.kind(), "{summary}"),
            AlertSeverity::Warning => warn!(kind = alert.kind(), "{summary}"),
            AlertSeverity::Critical => error!(kind = alert.kind(), "{summary}"),
        }
    }
}

/// Publishes alerts for in-process subscribers (front ends, tests).
#[derive(Clone)]
pub struct BroadcastAlertSink {
    tx: broadcast::Sender<Alert>,
}

impl BroadcastAlertSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl AlertSink for BroadcastAlertSink {
    async fn alert(&self, alert: Alert) {
        // Nobody listening is fine.
        let _ = self.tx.send(alert);
    }
}

/// Forwards every alert to each inner sink in order.
#[derive(Default, Clone)]
pub struct FanOutAlertSink {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl FanOutAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl AlertSink for FanOutAlertSink {
    async fn alert(&self, alert: Alert) {
        for sink in &self.sinks {
            sink.alert(alert.clone()).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// Sink that remembers what it was given.
    #[derive(Default)]
    pub struct RecordingAlertSink {
        alerts: Mutex<Vec<Alert>>,
    }

    impl RecordingAlertSink {
        pub fn alerts(&self) -> Vec<Alert> {
            self.alerts.lock().clone()
        }
    }

    #[async_trait]
    impl AlertSink for RecordingAlertSink {
        async fn alert(&self, alert: Alert) {
            self.alerts.lock().push(alert);
        }
    }
}
