//! Delivery state change notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::database::models::DeliveryTaskDbModel;
use crate::domain::{DeliveryState, FailureReason};

/// Why a claimed task went back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ParkReason {
    /// Retryable error, waiting out the backoff.
    Backoff,
    /// Recipient is over its send budget.
    RateLimited,
    /// The dependency's circuit is open.
    BreakerOpen,
}

/// Published after every persisted state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub task_id: String,
    pub binding_id: i64,
    pub item_id: String,
    pub state: DeliveryState,
    pub failure_reason: Option<FailureReason>,
    pub park_reason: Option<ParkReason>,
    /// Set when the task was parked.
    pub next_attempt_at: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

impl DeliveryEvent {
    pub fn new(task: &DeliveryTaskDbModel, state: DeliveryState) -> Self {
        Self {
            task_id: task.id.clone(),
            binding_id: task.binding_id,
            item_id: task.item_id.clone(),
            state,
            failure_reason: None,
            park_reason: None,
            next_attempt_at: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(task: &DeliveryTaskDbModel, reason: FailureReason) -> Self {
        Self {
            failure_reason: Some(reason),
            ..Self::new(task, DeliveryState::Failed)
        }
    }

    pub fn parked(task: &DeliveryTaskDbModel, reason: ParkReason, until_ms: i64) -> Self {
        Self {
            park_reason: Some(reason),
            next_attempt_at: Some(until_ms),
            ..Self::new(task, DeliveryState::Pending)
        }
    }
}
