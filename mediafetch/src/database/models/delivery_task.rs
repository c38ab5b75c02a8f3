//! Delivery task database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::{ContentKind, DeliveryState, FailureReason, RecipientId, SourceId};

/// One (binding, item) delivery lifecycle.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryTaskDbModel {
    pub id: String,
    pub binding_id: i64,
    pub source_id: String,
    pub recipient_id: String,
    pub item_id: String,
    pub content_kind: String,
    pub payload_ref: String,
    pub caption: Option<String>,
    pub permalink: Option<String>,
    /// Status: PENDING, FETCHING, PROCESSING, DELIVERED, FAILED
    pub state: String,
    /// Failed payload downloads so far.
    pub fetch_attempts: i64,
    /// Failed sends so far.
    pub send_attempts: i64,
    /// Retries allowed per phase after the first attempt.
    pub max_retries: i64,
    pub last_error: Option<String>,
    pub failure_reason: Option<String>,
    /// Acknowledgment id returned by the sender.
    pub ack_id: Option<String>,
    pub next_attempt_at: i64,
    /// Token of the current claim. Later transitions must present it.
    pub claim_token: Option<String>,
    /// Set while a worker holds the claim.
    pub lease_until: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub terminal_at: Option<i64>,
}

impl DeliveryTaskDbModel {
    pub fn state(&self) -> Option<DeliveryState> {
        DeliveryState::parse(&self.state)
    }

    pub fn kind(&self) -> Option<ContentKind> {
        ContentKind::parse(&self.content_kind)
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        self.failure_reason.as_deref().and_then(FailureReason::parse)
    }

    pub fn source(&self) -> SourceId {
        SourceId::new(self.source_id.clone())
    }

    pub fn recipient(&self) -> RecipientId {
        RecipientId::new(self.recipient_id.clone())
    }
}

/// Insert payload for a new task.
#[derive(Debug, Clone)]
pub struct NewDeliveryTask {
    pub binding_id: i64,
    pub source_id: SourceId,
    pub recipient_id: RecipientId,
    pub item_id: String,
    pub kind: ContentKind,
    pub payload_ref: String,
    pub caption: Option<String>,
    pub permalink: Option<String>,
    pub max_retries: u32,
    /// Earliest attempt time in epoch milliseconds.
    pub not_before: i64,
}

/// Count of tasks per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStatusCounts {
    pub pending: i64,
    pub fetching: i64,
    pub processing: i64,
    pub delivered: i64,
    pub failed: i64,
}

impl DeliveryStatusCounts {
    pub fn in_flight(&self) -> i64 {
        self.fetching + self.processing
    }
}
