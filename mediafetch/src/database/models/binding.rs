//! Binding database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::{BindingPreferences, RecipientId, SourceId};

/// Confirmed link between a source account and a recipient.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BindingDbModel {
    pub id: i64,
    pub source_id: String,
    pub recipient_id: String,
    pub active: bool,
    pub confirmed_at: i64,
    pub last_activity_at: i64,
    /// JSON blob of [`BindingPreferences`]
    pub preferences: String,
    pub consecutive_failures: i64,
    pub deactivated_at: Option<i64>,
    pub deactivated_reason: Option<String>,
}

impl BindingDbModel {
    pub fn source(&self) -> SourceId {
        SourceId::new(self.source_id.clone())
    }

    pub fn recipient(&self) -> RecipientId {
        RecipientId::new(self.recipient_id.clone())
    }

    /// Decoded preferences; a corrupt blob falls back to defaults.
    pub fn preferences(&self) -> BindingPreferences {
        serde_json::from_str(&self.preferences).unwrap_or_else(|e| {
            tracing::warn!(binding_id = self.id, error = %e, "Unreadable binding preferences");
            BindingPreferences::default()
        })
    }
}

/// Why a binding stopped being active.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeactivationReason {
    /// Recipient asked to unlink.
    Revoked,
    /// Too many consecutive failed deliveries.
    DeliveryFailures,
}

impl DeactivationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Revoked => "REVOKED",
            Self::DeliveryFailures => "DELIVERY_FAILURES",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ContentKind;

    #[test]
    fn test_preferences_decode() {
        let mut binding = BindingDbModel {
            id: 1,
            source_id: "s1".into(),
            recipient_id: "u1".into(),
            active: true,
            confirmed_at: 0,
            last_activity_at: 0,
            preferences: r#"{"content_kinds":["media_post"]}"#.into(),
            consecutive_failures: 0,
            deactivated_at: None,
            deactivated_reason: None,
        };
        assert!(binding.preferences().accepts(ContentKind::MediaPost));
        assert!(!binding.preferences().accepts(ContentKind::Story));

        binding.preferences = "not json".into();
        assert_eq!(binding.preferences(), BindingPreferences::default());
    }
}
