//! Remote content discovered while polling a source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use strum::{Display, EnumIter, EnumString};

use super::identity::SourceId;

/// Kinds of content a source can publish.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ContentKind {
    MediaPost,
    Story,
    DirectMessage,
    ReelShare,
    Text,
}

impl ContentKind {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MediaPost => "media_post",
            Self::Story => "story",
            Self::DirectMessage => "direct_message",
            Self::ReelShare => "reel_share",
            Self::Text => "text",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    /// Whether items of this kind carry user-written text worth forwarding.
    pub fn has_caption(&self) -> bool {
        !matches!(self, Self::Story)
    }

    /// Whether a binary payload must be downloaded before sending.
    pub fn has_binary_payload(&self) -> bool {
        matches!(self, Self::MediaPost | Self::Story | Self::ReelShare)
    }

    /// Whether the payload is time-based media.
    pub fn has_duration(&self) -> bool {
        matches!(self, Self::Story | Self::ReelShare)
    }
}

/// Position of the newest item already processed for a source.
///
/// Ordered by `(position, item_id)` so items sharing a timestamp still have a
/// total order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Monotonic sort key, usually the publish time in epoch milliseconds.
    pub position: i64,
    pub item_id: String,
}

impl Cursor {
    pub fn new(position: i64, item_id: impl Into<String>) -> Self {
        Self {
            position,
            item_id: item_id.into(),
        }
    }
}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cursor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.position
            .cmp(&other.position)
            .then_with(|| self.item_id.cmp(&other.item_id))
    }
}

/// A unit of remote content. Never persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub source_id: SourceId,
    pub item_id: String,
    pub kind: ContentKind,
    pub position: i64,
    pub discovered_at: DateTime<Utc>,
    /// Remote URL or platform handle; never the bytes.
    pub payload_ref: String,
    pub caption: Option<String>,
    pub permalink: Option<String>,
}

impl ContentItem {
    pub fn new(
        source_id: SourceId,
        item_id: impl Into<String>,
        kind: ContentKind,
        position: i64,
        payload_ref: impl Into<String>,
    ) -> Self {
        Self {
            source_id,
            item_id: item_id.into(),
            kind,
            position,
            discovered_at: Utc::now(),
            payload_ref: payload_ref.into(),
            caption: None,
            permalink: None,
        }
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    pub fn with_permalink(mut self, permalink: impl Into<String>) -> Self {
        self.permalink = Some(permalink.into());
        self
    }

    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.position, self.item_id.clone())
    }
}
