//! Contracts with the source and destination platforms.
//!
//! Concrete platform clients live outside this crate; the monitor and the
//! delivery pipeline only talk to these traits. A generic HTTP payload
//! fetcher is provided in [`http`], and [`bridge`] reaches platform adapters
//! running as a separate service.

pub mod bridge;
pub mod http;

pub use bridge::{BridgeConfig, HttpDeliverySender, HttpSourceFetcher};
pub use http::{HttpPayloadFetcher, HttpPayloadFetcherConfig};

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ContentItem, ContentKind, Cursor, RecipientId, SourceId};

/// Errors from listing new items on a source.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("source credentials expired: {0}")]
    AuthExpired(String),

    #[error("source platform rate limited the request")]
    RateLimited { retry_after: Option<Duration> },

    #[error("source platform unreachable: {0}")]
    Unreachable(String),
}

impl FetchError {
    /// Expired credentials need a human; everything else clears up on its own.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::AuthExpired(_))
    }

    /// Whether the error should count against the source platform breaker.
    pub fn is_dependency_failure(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// Lists items published by a source account.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Items strictly newer than `since`, oldest first. `None` means the
    /// source has never been polled.
    async fn fetch_new_items(
        &self,
        source: &SourceId,
        since: Option<&Cursor>,
    ) -> Result<Vec<ContentItem>, FetchError>;
}

/// What the pipeline needs to download one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRef {
    pub source_id: SourceId,
    pub item_id: String,
    pub kind: ContentKind,
    pub payload_ref: String,
}

/// Downloaded item body.
#[derive(Debug, Clone)]
pub struct Payload {
    pub bytes: Bytes,
    pub kind: ContentKind,
    /// MIME type reported by the remote, if any.
    pub content_type: Option<String>,
}

impl Payload {
    pub fn empty(kind: ContentKind) -> Self {
        Self {
            bytes: Bytes::new(),
            kind,
            content_type: None,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum PayloadError {
    /// Deleted upstream; never retried.
    #[error("item no longer exists upstream")]
    NotFound,

    #[error("payload larger than {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("payload source unreachable: {0}")]
    Unreachable(String),
}

impl PayloadError {
    /// Transient errors are retried and count against the breaker.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// Downloads item payloads.
#[async_trait]
pub trait PayloadFetcher: Send + Sync {
    async fn fetch_payload(&self, item: &ItemRef) -> Result<Payload, PayloadError>;
}

/// Context sent alongside a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryMetadata {
    pub task_id: String,
    pub source_id: SourceId,
    pub item_id: String,
    pub kind: ContentKind,
    pub caption: Option<String>,
    pub permalink: Option<String>,
}

/// Acknowledgment from the destination platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAck {
    pub message_id: String,
}

#[derive(Debug, Clone, Error)]
pub enum SendError {
    #[error("recipient is invalid: {0}")]
    RecipientInvalid(String),

    #[error("payload rejected: {0}")]
    PayloadRejected(String),

    #[error("destination platform unreachable: {0}")]
    Unreachable(String),
}

impl SendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// Hands payloads to the messaging platform.
#[async_trait]
pub trait DeliverySender: Send + Sync {
    async fn send(
        &self,
        recipient: &RecipientId,
        payload: &Payload,
        metadata: &DeliveryMetadata,
    ) -> Result<DeliveryAck, SendError>;
}
