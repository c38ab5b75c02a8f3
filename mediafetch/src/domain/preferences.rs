//! Per-binding delivery preferences.

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use super::content::ContentKind;

/// How soon a matched item is handed to the delivery pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCadence {
    #[default]
    Immediate,
    /// Batched to the next top of the hour.
    Hourly,
    /// Batched to the next UTC midnight.
    Daily,
}

impl NotificationCadence {
    /// Earliest time a task created at `now` may be attempted.
    pub fn next_slot(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let step = match self {
            Self::Immediate => return now,
            Self::Hourly => Duration::hours(1),
            Self::Daily => Duration::days(1),
        };
        match now.duration_trunc(step) {
            Ok(start) => start + step,
            Err(_) => now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingPreferences {
    /// Kinds forwarded to the recipient. Empty means nothing is forwarded.
    pub content_kinds: Vec<ContentKind>,
    pub cadence: NotificationCadence,
    /// Prefix captions with the source account name.
    pub include_attribution: bool,
}

impl Default for BindingPreferences {
    fn default() -> Self {
        Self {
            content_kinds: ContentKind::iter().collect(),
            cadence: NotificationCadence::Immediate,
            include_attribution: true,
        }
    }
}

impl BindingPreferences {
    pub fn accepts(&self, kind: ContentKind) -> bool {
        self.content_kinds.contains(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_default_accepts_everything() {
        let prefs = BindingPreferences::default();
        assert!(ContentKind::iter().all(|k| prefs.accepts(k)));
    }

    #[test]
    fn test_missing_fields_fall_back_to_defaults() {
        let prefs: BindingPreferences =
            serde_json::from_str(r#"{"content_kinds":["story"]}"#).unwrap();
        assert!(prefs.accepts(ContentKind::Story));
        assert!(!prefs.accepts(ContentKind::MediaPost));
        assert_eq!(prefs.cadence, NotificationCadence::Immediate);
        assert!(prefs.include_attribution);
    }

    #[test]
    fn test_cadence_slots() {
        let now = Utc.with_ymd_and_hms(2026, 3, 4, 10, 25, 0).unwrap();
        assert_eq!(NotificationCadence::Immediate.next_slot(now), now);
        assert_eq!(
            NotificationCadence::Hourly.next_slot(now),
            Utc.with_ymd_and_hms(2026, 3, 4, 11, 0, 0).unwrap()
        );
        assert_eq!(
            NotificationCadence::Daily.next_slot(now),
            Utc.with_ymd_and_hms(2026, 3, 5, 0, 0, 0).unwrap()
        );
    }
}
