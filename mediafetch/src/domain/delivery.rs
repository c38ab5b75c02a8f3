//! Delivery task state machine.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::Error;

/// Lifecycle of a delivery task.
///
/// `Pending` doubles as the parked state: a task waiting on backoff, a rate
/// limit reset or a breaker cooldown sits in `Pending` with a future
/// `next_attempt_at`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
    #[default]
    Pending,
    /// Claimed by a worker, payload download in progress.
    Fetching,
    /// Payload in hand, transforming and handing off to the sender.
    Processing,
    Delivered,
    Failed,
}

impl DeliveryState {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Fetching => "FETCHING",
            Self::Processing => "PROCESSING",
            Self::Delivered => "DELIVERED",
            Self::Failed => "FAILED",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }

    /// Validate a state transition.
    pub fn can_transition_to(&self, target: DeliveryState) -> bool {
        use DeliveryState::*;

        match (self, target) {
            (Pending, Fetching) => true,
            (Fetching, Processing) => true,
            (Processing, Delivered) => true,
            // Parking after a retryable failure, a rate limit or an open breaker
            (Fetching | Processing, Pending) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&self, target: DeliveryState) -> Result<DeliveryState, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

/// Why a task ended in `Failed`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    /// Payload download kept failing past the retry limit.
    FetchExhausted,
    /// Send kept failing past the retry limit.
    DeliveryExhausted,
    /// The item was deleted upstream.
    ContentGone,
    RecipientInvalid,
    PayloadRejected,
    Cancelled,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FetchExhausted => "FETCH_EXHAUSTED",
            Self::DeliveryExhausted => "DELIVERY_EXHAUSTED",
            Self::ContentGone => "CONTENT_GONE",
            Self::RecipientInvalid => "RECIPIENT_INVALID",
            Self::PayloadRejected => "PAYLOAD_REJECTED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    /// Whether this outcome counts against the binding's health.
    pub fn counts_against_binding(&self) -> bool {
        matches!(self, Self::DeliveryExhausted | Self::RecipientInvalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let state = DeliveryState::Pending;
        let state = state.transition_to(DeliveryState::Fetching).unwrap();
        let state = state.transition_to(DeliveryState::Processing).unwrap();
        let state = state.transition_to(DeliveryState::Delivered).unwrap();
        assert!(state.is_terminal());
    }

    #[test]
    fn test_failed_reachable_from_any_live_state() {
        for state in [
            DeliveryState::Pending,
            DeliveryState::Fetching,
            DeliveryState::Processing,
        ] {
            assert!(state.can_transition_to(DeliveryState::Failed));
        }
        assert!(!DeliveryState::Delivered.can_transition_to(DeliveryState::Failed));
        assert!(!DeliveryState::Failed.can_transition_to(DeliveryState::Failed));
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let err = DeliveryState::Pending
            .transition_to(DeliveryState::Delivered)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert!(!DeliveryState::Delivered.can_transition_to(DeliveryState::Pending));
    }

    #[test]
    fn test_db_strings() {
        assert_eq!(DeliveryState::parse("PROCESSING"), Some(DeliveryState::Processing));
        assert_eq!(DeliveryState::Fetching.to_string(), "FETCHING");
        assert_eq!(
            FailureReason::parse("FETCH_EXHAUSTED"),
            Some(FailureReason::FetchExhausted)
        );
        assert_eq!(FailureReason::Cancelled.to_string(), FailureReason::Cancelled.as_str());
    }
}
