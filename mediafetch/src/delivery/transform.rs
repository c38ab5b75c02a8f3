//! Processing step between download and send.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::database::models::DeliveryTaskDbModel;
use crate::domain::{BindingPreferences, ContentKind};
use crate::platform::{DeliveryMetadata, Payload};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Payloads larger than this are rejected before sending.
    pub max_payload_bytes: u64,
    /// Caption body length in characters, excluding the header.
    pub caption_limit: usize,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 50 * 1024 * 1024,
            caption_limit: 200,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("payload is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },
}

/// Payload plus the metadata handed to the sender.
#[derive(Debug, Clone)]
pub struct PreparedDelivery {
    pub payload: Payload,
    pub metadata: DeliveryMetadata,
}

fn kind_label(kind: ContentKind) -> &'static str {
    match kind {
        ContentKind::MediaPost => "post",
        ContentKind::Story => "story",
        ContentKind::DirectMessage => "message",
        ContentKind::ReelShare => "reel",
        ContentKind::Text => "text post",
    }
}

/// Cut `text` to `limit` characters, marking the cut with an ellipsis.
pub fn truncate_chars(text: &str, limit: usize) -> String {
    let mut chars = text.char_indices();
    match chars.nth(limit) {
        None => text.to_string(),
        Some((byte_idx, _)) => {
            let cut = text[..byte_idx].trim_end();
            format!("{cut}…")
        }
    }
}

/// Build the caption shown to the recipient.
///
/// Kinds without captions only get the attribution line. Returns `None` when
/// there is nothing to say.
pub fn format_caption(
    kind: ContentKind,
    source: &str,
    caption: Option<&str>,
    permalink: Option<&str>,
    include_attribution: bool,
    limit: usize,
) -> Option<String> {
    let mut parts = Vec::new();

    if include_attribution {
        parts.push(format!("New {} from @{source}", kind_label(kind)));
    }

    if kind.has_caption()
        && let Some(body) = caption.map(str::trim).filter(|c| !c.is_empty())
    {
        parts.push(truncate_chars(body, limit));
    }

    if let Some(link) = permalink {
        parts.push(link.to_string());
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// Check limits and attach metadata.
pub fn prepare(
    task: &DeliveryTaskDbModel,
    kind: ContentKind,
    payload: Payload,
    preferences: &BindingPreferences,
    config: &TransformConfig,
) -> Result<PreparedDelivery, TransformError> {
    let size = payload.bytes.len() as u64;
    if size > config.max_payload_bytes {
        return Err(TransformError::TooLarge {
            size,
            limit: config.max_payload_bytes,
        });
    }

    let caption = format_caption(
        kind,
        &task.source_id,
        task.caption.as_deref(),
        task.permalink.as_deref(),
        preferences.include_attribution,
        config.caption_limit,
    );

    Ok(PreparedDelivery {
        payload,
        metadata: DeliveryMetadata {
            task_id: task.id.clone(),
            source_id: task.source(),
            item_id: task.item_id.clone(),
            kind,
            caption,
            permalink: task.permalink.clone(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("héllo world", 5), "héllo…");
        assert_eq!(truncate_chars("abc def", 4), "abc…");
    }

    #[test]
    fn test_caption_with_attribution() {
        let caption = format_caption(
            ContentKind::MediaPost,
            "alice",
            Some("sunset "),
            Some("https://example.com/p/1"),
            true,
            200,
        )
        .unwrap();
        assert_eq!(
            caption,
            "New post from @alice\n\nsunset\n\nhttps://example.com/p/1"
        );
    }

    #[test]
    fn test_story_caption_is_dropped() {
        let caption = format_caption(ContentKind::Story, "alice", Some("hidden"), None, true, 200);
        assert_eq!(caption.as_deref(), Some("New story from @alice"));
        assert_eq!(
            format_caption(ContentKind::Story, "alice", Some("hidden"), None, false, 200),
            None
        );
    }

    #[test]
    fn test_prepare_rejects_oversized_payload() {
        let task = DeliveryTaskDbModel {
            id: "t1".into(),
            binding_id: 1,
            source_id: "alice".into(),
            recipient_id: "u1".into(),
            item_id: "p1".into(),
            content_kind: "media_post".into(),
            payload_ref: "https://cdn.example.com/p1.jpg".into(),
            caption: Some("x".repeat(300)),
            permalink: None,
            state: "PROCESSING".into(),
            fetch_attempts: 0,
            send_attempts: 0,
            max_retries: 3,
            last_error: None,
            failure_reason: None,
            ack_id: None,
            next_attempt_at: 0,
            claim_token: Some("c1".into()),
            lease_until: None,
            created_at: 0,
            updated_at: 0,
            terminal_at: None,
        };
        let config = TransformConfig {
            max_payload_bytes: 4,
            caption_limit: 200,
        };
        let prefs = BindingPreferences::default();

        let big = Payload {
            bytes: Bytes::from_static(b"12345"),
            kind: ContentKind::MediaPost,
            content_type: None,
        };
        assert_eq!(
            prepare(&task, ContentKind::MediaPost, big, &prefs, &config).unwrap_err(),
            TransformError::TooLarge { size: 5, limit: 4 }
        );

        let ok = Payload::empty(ContentKind::MediaPost);
        let prepared = prepare(&task, ContentKind::MediaPost, ok, &prefs, &config).unwrap();
        let caption = prepared.metadata.caption.unwrap();
        assert!(caption.ends_with('…'));
        assert_eq!(prepared.metadata.task_id, "t1");
    }
}
