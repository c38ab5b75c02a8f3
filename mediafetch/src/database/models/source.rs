//! Monitored source database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::{Cursor, SourceId};

/// A source account under periodic polling. One row per source regardless
/// of how many bindings reference it.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MonitoredSourceDbModel {
    pub source_id: String,
    pub poll_interval_ms: i64,
    pub enabled: bool,
    pub cursor_position: Option<i64>,
    pub cursor_item_id: Option<String>,
    pub last_checked_at: Option<i64>,
    pub consecutive_failures: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
}

impl MonitoredSourceDbModel {
    pub fn source(&self) -> SourceId {
        SourceId::new(self.source_id.clone())
    }

    pub fn cursor(&self) -> Option<Cursor> {
        match (self.cursor_position, &self.cursor_item_id) {
            (Some(position), Some(item_id)) => Some(Cursor::new(position, item_id.clone())),
            _ => None,
        }
    }

    /// Whether a check is due at `now_ms`.
    pub fn is_due(&self, now_ms: i64) -> bool {
        match self.last_checked_at {
            None => true,
            Some(last) => now_ms >= last.saturating_add(self.poll_interval_ms),
        }
    }

    /// Epoch milliseconds of the next scheduled check.
    pub fn next_check_at(&self) -> i64 {
        self.last_checked_at
            .map(|last| last.saturating_add(self.poll_interval_ms))
            .unwrap_or(0)
    }
}
